mod common;

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use agricoll_sync::crypto::NativeCrypto;
use agricoll_sync::logging;
use agricoll_sync::pipeline::{Pipeline, PipelineSettings};
use agricoll_sync::selector::ExportSuffixes;
use agricoll_sync::storage::ContactStore;
use tempfile::TempDir;

use common::{key_source, partner_directory, MemoryConnector};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("capture lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn run_logs_transitions_and_no_key_material() {
    let capture = Capture::default();
    logging::set_writer(Box::new(capture.clone()));

    let work = TempDir::new().expect("tempdir");
    let connector = MemoryConnector::new(partner_directory());
    let mut store = ContactStore::open_in_memory().expect("store");
    let pipeline = Pipeline::new(
        &connector,
        &NativeCrypto,
        PipelineSettings {
            remote_dir: ".".to_string(),
            suffixes: ExportSuffixes::default(),
            work_dir: work.path().to_path_buf(),
            private_key: key_source("recipient_private.pem"),
        },
    );
    pipeline.run(&mut store).expect("run");

    let log = String::from_utf8(capture.0.lock().expect("capture lock").clone()).expect("utf8 log");
    for line in [
        "pipeline: connecting -> selecting",
        "pipeline: selecting -> unwrapping",
        "pipeline: unwrapping -> decrypting",
        "pipeline: decrypting -> importing",
        "pipeline: importing -> cleaning_up",
        "pipeline: cleaning_up -> succeeded",
    ] {
        assert!(log.contains(line), "missing {line:?} in:\n{log}");
    }
    assert!(log.contains("src/pipeline.rs:"));
    assert!(log.contains("export.csv.encrypted"));
    assert!(!log.contains("U44bWyJNJHMEXxYkB8Wtj"));
    assert!(!log.contains("PRIVATE KEY"));
}
