use std::{error::Error, fs, path::PathBuf};

use tempfile::tempdir;
use vaultlog::{
    decode_to_file, gen_ecdh_key_pair, Config, Domain, Engine, Format, Level, Location, Meta,
    PatternFormatter, Record,
};

fn records(messages: &[String]) -> Vec<Record<'_>> {
    messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let level = Level::from_primitive(index as u8 % 6).unwrap_or_default();
            let location = Location::new(index as u32 + 1, "src/main.rs", "handle_request");
            let meta = Meta::new(level, 1_700_000_000_000 + index as u64, 4242, 77, location);
            Record::new(meta, message)
        })
        .collect()
}

fn render(records: &[Record], pattern: &str) -> Vec<u8> {
    let mut formatter = PatternFormatter::new(pattern);
    let mut output = Vec::new();
    for record in records {
        formatter.format(record, &mut output).unwrap();
    }
    output
}

fn logfiles(domain: &Domain) -> Vec<PathBuf> {
    let mut files: Vec<_> = fs::read_dir(&domain.directory)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == vaultlog::FILE_EXTENSION))
        .collect();
    // The names are generated in order.
    files.sort();
    files
}

/// Entire Process: `Log` -> `Flush` -> `Decode`, with encryption.
#[test]
fn test_entire_process() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let domain = Domain::new("test", dir.path().join("logs"));
    let (secret_key, public_key) = gen_ecdh_key_pair();

    let messages: Vec<_> =
        (0..200).map(|i| format!("request {i} served in {}ms", i * 7 % 13)).collect();
    let records = records(&messages);

    let engine = Engine::new(domain.clone(), Config::new().key(public_key))?;
    for (index, record) in records.iter().enumerate() {
        engine.log(record);
        // Several chunks, each a separate compression stream.
        if index % 64 == 63 {
            engine.flush();
        }
    }
    engine.shutdown();

    let files = logfiles(&domain);
    assert_eq!(files.len(), 1);

    // Encrypted: without the key the decoding fails, and the wrong key is rejected.
    let output = dir.path().join("test.txt");
    assert!(decode_to_file(&files[0], &output, None, PatternFormatter::default()).is_err());
    let (wrong_key, _) = gen_ecdh_key_pair();
    let decoded = decode_to_file(&files[0], &output, Some(wrong_key), PatternFormatter::default());
    assert!(decoded.is_err());
    assert!(!output.exists());

    decode_to_file(&files[0], &output, Some(secret_key), PatternFormatter::default())?;
    assert_eq!(fs::read(&output)?, render(&records, ""));

    let pattern = "%l %M %p:%t %F:%f:%# %v";
    decode_to_file(&files[0], &output, Some(secret_key), PatternFormatter::new(pattern))?;
    assert_eq!(fs::read(&output)?, render(&records, pattern));
    Ok(())
}

#[test]
fn test_plaintext() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let domain = Domain::new("plain", dir.path());

    let messages: Vec<_> = (0..20).map(|i| format!("plain message {i}")).collect();
    let records = records(&messages);

    let engine = domain.clone().engine_with_default_config()?;
    for record in &records {
        engine.log(record);
    }
    engine.shutdown();

    let files = logfiles(&domain);
    assert_eq!(files.len(), 1);

    let mut decoded = Vec::new();
    vaultlog::decode(&files[0], None, |record| {
        decoded.push(format!("{record:?}"));
        Ok(())
    })?;
    let expected: Vec<_> = records.iter().map(|record| format!("{record:?}")).collect();
    assert_eq!(decoded, expected);
    Ok(())
}

#[test]
fn test_nothing_logged() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let domain = Domain::new("empty", dir.path());

    let engine = Engine::new(domain.clone(), Config::new())?;
    engine.flush();
    engine.shutdown();

    assert!(logfiles(&domain).is_empty());
    Ok(())
}
