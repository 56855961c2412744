//! Partner-side helper: produce exports in the format `agricoll-sync`
//! consumes, and print host key fingerprints for pinning.

use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;

use agricoll_sync::channel::fingerprint_openssh_line;
use agricoll_sync::config::ENV_PRIVATE_KEY;
use agricoll_sync::crypto::{encrypt_payload, wrap_key, SymmetricKey};
use agricoll_sync::selector::{DEFAULT_DATA_SUFFIX, DEFAULT_KEY_SUFFIX};

const DEFAULT_KEY_BITS: usize = 2048;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut args = env::args().collect::<Vec<String>>();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = args[1].clone();
    let command_args = args.split_off(2);

    match command.as_str() {
        "encrypt" => encrypt(&command_args),
        "keygen" => keygen(&command_args),
        "fingerprint" => fingerprint(&command_args),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!(
        "agricoll-export commands:\n\
         \n\
         encrypt <public.pem> <export.csv> <out-dir>\n\
         keygen <out-dir> [--bits <n>]\n\
         fingerprint <host_key.pub>\n\
         \n\
         encrypt writes <name>{DEFAULT_DATA_SUFFIX} and <name>{DEFAULT_KEY_SUFFIX}.\n\
         keygen prints the {ENV_PRIVATE_KEY} value for the new key."
    );
}

fn encrypt(args: &[String]) -> Result<(), Box<dyn Error>> {
    let [public_key, csv, out_dir] = args else {
        return Err("usage: encrypt <public.pem> <export.csv> <out-dir>".into());
    };
    let public_pem = fs::read_to_string(public_key)?;
    let plaintext = fs::read(csv)?;
    if std::str::from_utf8(&plaintext).is_err() {
        return Err(format!("{csv} is not UTF-8").into());
    }

    let key = SymmetricKey::generate();
    let envelope = encrypt_payload(&plaintext, key.passphrase(), None)?;
    let wrapped = wrap_key(&public_pem, &key)?;

    let name = Path::new(csv)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or("export path has no file name")?;
    let out_dir = PathBuf::from(out_dir);
    fs::create_dir_all(&out_dir)?;
    let data_path = out_dir.join(format!("{name}{DEFAULT_DATA_SUFFIX}"));
    let key_path = out_dir.join(format!("{name}{DEFAULT_KEY_SUFFIX}"));
    // key last, so a reader never sees a key without its payload
    fs::write(&data_path, envelope)?;
    fs::write(&key_path, wrapped)?;

    println!("{}", data_path.display());
    println!("{}", key_path.display());
    Ok(())
}

fn keygen(args: &[String]) -> Result<(), Box<dyn Error>> {
    let mut out_dir = None;
    let mut bits = DEFAULT_KEY_BITS;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--bits" => {
                let value = iter.next().ok_or("--bits needs a value")?;
                bits = value.parse()?;
            }
            _ if out_dir.is_none() => out_dir = Some(PathBuf::from(arg)),
            other => return Err(format!("unexpected argument {other}").into()),
        }
    }
    let out_dir = out_dir.ok_or("usage: keygen <out-dir> [--bits <n>]")?;
    fs::create_dir_all(&out_dir)?;

    let private_key = RsaPrivateKey::new(&mut OsRng, bits)?;
    let private_pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
    let public_pem = private_key.to_public_key().to_public_key_pem(LineEnding::LF)?;

    let private_path = out_dir.join("agricoll_private.pem");
    let public_path = out_dir.join("agricoll_public.pem");
    fs::write(&private_path, private_pem.as_bytes())?;
    fs::write(&public_path, public_pem)?;

    eprintln!("wrote {} and {}", private_path.display(), public_path.display());
    println!("{ENV_PRIVATE_KEY}={}", STANDARD.encode(private_pem.as_bytes()));
    Ok(())
}

fn fingerprint(args: &[String]) -> Result<(), Box<dyn Error>> {
    let [path] = args else {
        return Err("usage: fingerprint <host_key.pub>".into());
    };
    let contents = fs::read_to_string(path)?;
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        println!("{}", fingerprint_openssh_line(line)?);
    }
    Ok(())
}
