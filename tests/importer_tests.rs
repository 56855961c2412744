mod common;

use std::io::Cursor;

use agricoll_sync::importer::{ContactImporter, ContactUpsertResult, ImportError};
use agricoll_sync::storage::{ContactRecord, ContactStore};
use rusqlite::Connection;
use tempfile::TempDir;

use common::fixture;

const HEADER: &str = "Structure;Prénom;Nom;Mail;Fonction_hiérarchique;Complément_fonction;Téléphone;Mobile\n";

fn import_str(store: &mut ContactStore, body: &str) -> Result<ContactUpsertResult, ImportError> {
    ContactImporter::new(store).import_reader(Cursor::new(format!("{HEADER}{body}")))
}

#[test]
fn imports_fixture_export() {
    let mut store = ContactStore::open_in_memory().expect("store");
    let result = ContactImporter::new(&mut store)
        .import(&fixture("contacts.csv"))
        .expect("import");

    assert_eq!(result.imported, 3);
    assert_eq!(result.created, 3);
    assert_eq!(result.updated, 0);
    assert_eq!(result.skipped, 1);
    assert_eq!(store.count_contacts().expect("count"), 3);

    let camille = store
        .get_contact("camille.durand@agriculture.gouv.fr")
        .expect("query")
        .expect("present");
    assert_eq!(
        camille,
        ContactRecord {
            email: "camille.durand@agriculture.gouv.fr".into(),
            structure_path: "DRAAF Occitanie / SRAL".into(),
            given_name: "Camille".into(),
            family_name: "Durand".into(),
            role_title: "Chef de service".into(),
            role_detail: "Santé des végétaux".into(),
            phone: "04 67 10 18 00".into(),
            mobile: "06 12 34 56 78".into(),
        }
    );

    let jean = store
        .get_contact("Jean.Martin@herault.gouv.fr")
        .expect("query")
        .expect("present");
    assert_eq!(jean.role_detail, "");
    assert_eq!(jean.mobile, "");
}

#[test]
fn second_import_of_same_file_changes_nothing() {
    let mut store = ContactStore::open_in_memory().expect("store");
    ContactImporter::new(&mut store)
        .import(&fixture("contacts.csv"))
        .expect("first import");
    let before = store.list_contacts().expect("list");

    let again = ContactImporter::new(&mut store)
        .import(&fixture("contacts.csv"))
        .expect("second import");
    assert_eq!(again.created, 0);
    assert_eq!(again.updated, 3);
    assert_eq!(again.skipped, 1);
    assert_eq!(store.list_contacts().expect("list"), before);
}

#[test]
fn update_overwrites_every_attribute() {
    let mut store = ContactStore::open_in_memory().expect("store");
    import_str(&mut store, "Old;A;B;a@x.fr;T;D;01;06\n").expect("first");
    let result = import_str(&mut store, "New;;C;a@x.fr;;;;\n").expect("second");
    assert_eq!(result.updated, 1);

    let stored = store.get_contact("a@x.fr").expect("query").expect("present");
    assert_eq!(stored.structure_path, "New");
    assert_eq!(stored.given_name, "");
    assert_eq!(stored.family_name, "C");
    assert_eq!(stored.phone, "");
}

#[test]
fn duplicate_email_in_one_file_keeps_last_row() {
    let mut store = ContactStore::open_in_memory().expect("store");
    let result = import_str(
        &mut store,
        "S;A;First;dup@x.fr;;;;\nS;A;Second;dup@x.fr;;;;\n",
    )
    .expect("import");
    assert_eq!(result.created, 1);
    assert_eq!(result.updated, 1);
    let stored = store.get_contact("dup@x.fr").expect("query").expect("present");
    assert_eq!(stored.family_name, "Second");
}

#[test]
fn invalid_row_rolls_back_whole_file() {
    let mut store = ContactStore::open_in_memory().expect("store");
    import_str(&mut store, "S;A;Kept;kept@x.fr;;;;\n").expect("seed");

    let err = import_str(
        &mut store,
        "S;A;Changed;kept@x.fr;;;;\nS;B;New;new@x.fr;;;;\nS;C;Blank;   ;;;;\n",
    )
    .expect_err("blank mail must fail");
    assert!(matches!(err, ImportError::Row { line: 4, .. }));
    assert_eq!(err.line(), Some(4));

    assert_eq!(store.count_contacts().expect("count"), 1);
    let kept = store.get_contact("kept@x.fr").expect("query").expect("present");
    assert_eq!(kept.family_name, "Kept");
}

#[test]
fn storage_failure_mid_file_rolls_back_and_names_line() {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("contacts.db");
    let mut store = ContactStore::open(&db_path).expect("store");

    {
        let conn = Connection::open(&db_path).expect("side connection");
        conn.execute_batch(
            "CREATE TRIGGER refuse_blocked BEFORE INSERT ON contacts
             WHEN NEW.email = 'blocked@x.fr'
             BEGIN SELECT RAISE(ABORT, 'blocked address'); END;",
        )
        .expect("install trigger");
    }

    let err = import_str(
        &mut store,
        "S;A;One;one@x.fr;;;;\nS;B;Two;blocked@x.fr;;;;\nS;C;Three;three@x.fr;;;;\n",
    )
    .expect_err("trigger aborts the import");
    assert!(matches!(err, ImportError::Storage { line: Some(3), .. }));
    assert_eq!(store.count_contacts().expect("count"), 0);
}

#[test]
fn header_only_file_imports_nothing() {
    let mut store = ContactStore::open_in_memory().expect("store");
    let result = import_str(&mut store, "").expect("import");
    assert_eq!(result.imported, 0);
    assert_eq!(result.skipped, 0);
}

#[test]
fn missing_mail_column_is_a_header_error() {
    let mut store = ContactStore::open_in_memory().expect("store");
    let err = ContactImporter::new(&mut store)
        .import_reader(Cursor::new("Structure;Nom\nS;Durand\n"))
        .expect_err("no Mail column");
    assert!(matches!(err, ImportError::Header { line: 1, .. }));
}

#[test]
fn columns_may_be_reordered_or_missing() {
    let mut store = ContactStore::open_in_memory().expect("store");
    let result = ContactImporter::new(&mut store)
        .import_reader(Cursor::new("Mail;Nom\r\nz@x.fr;Zola\r\ninconnu;Nobody\r\n"))
        .expect("import");
    assert_eq!(result.imported, 1);
    assert_eq!(result.skipped, 1);
    let stored = store.get_contact("z@x.fr").expect("query").expect("present");
    assert_eq!(stored.family_name, "Zola");
    assert_eq!(stored.structure_path, "");
}
