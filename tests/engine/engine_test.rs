use std::fs::OpenOptions;
use std::io::Write;

use lumbung::engine::config::EngineConfig;
use lumbung::engine::statement::{Bound, Operation};
use lumbung::storage::btree::DuplicatePolicy;
use lumbung::storage::cipher::PageCipher;
use lumbung::storage::header::{DbHeader, JournalMode};
use lumbung::storage::pager::PageStore;
use lumbung::storage::wal::Wal;
use lumbung::types::PAGE_SIZE;
use lumbung::types::error::DatabaseError;
use lumbung::types::record::Record;
use lumbung::types::value::{DataType, Value};
use lumbung::utils::mock::{TempDatabase, create_test_record};

fn encrypted_config(key: &[u8]) -> EngineConfig {
    EngineConfig {
        key: Some(key.to_vec()),
        ..EngineConfig::default()
    }
}

fn scan_keys(engine: &mut lumbung::engine::Engine, tree: &str) -> Vec<i64> {
    let mut stmt = engine
        .prepare(Operation::Scan {
            tree: tree.to_string(),
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            reverse: false,
        })
        .unwrap();
    let mut keys = Vec::new();
    while engine.step(&mut stmt).unwrap() == lumbung::engine::statement::StepResult::Row {
        match stmt.column(0) {
            Some(Value::Integer(n)) => keys.push(*n),
            other => panic!("unexpected key {:?}", other),
        }
    }
    engine.finalize(&mut stmt).unwrap();
    keys
}

#[test]
fn test_insert_survives_reopen() {
    let mut db = TempDatabase::new();
    {
        let engine = db.create_engine().unwrap();
        engine
            .create_tree("items", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        for key in 1..=10i64 {
            engine
                .insert("items", Value::Integer(key), create_test_record(key))
                .unwrap();
        }
    }
    db.close_engine();

    let engine = db.create_engine().unwrap();
    for key in 1..=10i64 {
        let record = engine.lookup("items", &Value::Integer(key)).unwrap().unwrap();
        assert_eq!(record.get_value(0), Some(&Value::Text(format!("v{}", key))));
    }
    assert_eq!(scan_keys(engine, "items"), (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_explicit_transaction_commit_and_rollback() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();

    engine.begin_write().unwrap();
    engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();
    engine.insert("t", Value::Integer(2), create_test_record(2)).unwrap();
    engine.commit().unwrap();

    engine.begin_write().unwrap();
    engine.insert("t", Value::Integer(3), create_test_record(3)).unwrap();
    assert!(engine.lookup("t", &Value::Integer(3)).unwrap().is_some());
    engine.rollback().unwrap();

    assert!(engine.lookup("t", &Value::Integer(3)).unwrap().is_none());
    assert_eq!(scan_keys(engine, "t"), vec![1, 2]);
}

#[test]
fn test_crash_recovery_from_log() {
    let mut db = TempDatabase::new();
    let config = EngineConfig {
        // Keep the log around so every commit depends on recovery
        wal_autocheckpoint: 0,
        ..EngineConfig::default()
    };
    {
        let engine = db.create_engine_with(config.clone()).unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        for key in 0..50i64 {
            engine.insert("t", Value::Integer(key), create_test_record(key)).unwrap();
        }
    }
    // Simulate a crash: skip Drop so no close-time checkpoint runs
    let engine = db.engine.take().unwrap();
    std::mem::forget(engine);
    let wal_path = format!("{}-wal", db.path.display());
    assert!(std::fs::metadata(&wal_path).unwrap().len() > 0);

    let engine = db.create_engine_with(config).unwrap();
    assert_eq!(scan_keys(engine, "t"), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_recovery_ignores_torn_log_tail() {
    let mut db = TempDatabase::new();
    let config = EngineConfig {
        wal_autocheckpoint: 0,
        ..EngineConfig::default()
    };
    {
        let engine = db.create_engine_with(config.clone()).unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();
    }
    let engine = db.engine.take().unwrap();
    std::mem::forget(engine);

    // Garbage after the last commit marker, as a torn write would leave
    let wal_path = format!("{}-wal", db.path.display());
    let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(&[0xDE; 777]).unwrap();
    drop(file);

    let engine = db.create_engine_with(config).unwrap();
    assert_eq!(scan_keys(engine, "t"), vec![1]);
    engine.insert("t", Value::Integer(2), create_test_record(2)).unwrap();
    assert_eq!(scan_keys(engine, "t"), vec![1, 2]);
}

#[test]
fn test_reader_snapshot_unaffected_by_writer_rollback() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();

    let mut reader = db.open_second(EngineConfig::default()).unwrap();
    reader.begin_read().unwrap();
    assert_eq!(scan_keys_in_txn(&mut reader, "t"), vec![1]);

    let engine = db.get_engine().unwrap();
    engine.begin_write().unwrap();
    engine.insert("t", Value::Integer(2), create_test_record(2)).unwrap();
    engine.rollback().unwrap();

    assert_eq!(scan_keys_in_txn(&mut reader, "t"), vec![1]);
    reader.commit().unwrap();
    assert_eq!(scan_keys(&mut reader, "t"), vec![1]);
}

fn scan_keys_in_txn(engine: &mut lumbung::engine::Engine, tree: &str) -> Vec<i64> {
    // Same walk as scan_keys; the surrounding explicit transaction fixes
    // the snapshot.
    scan_keys(engine, tree)
}

#[test]
fn test_reader_sees_committed_write_after_txn_ends() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();

    let mut reader = db.open_second(EngineConfig::default()).unwrap();
    reader.begin_read().unwrap();
    assert_eq!(scan_keys(&mut reader, "t"), vec![1]);

    let engine = db.get_engine().unwrap();
    engine.insert("t", Value::Integer(2), create_test_record(2)).unwrap();

    // Still the old snapshot inside the read transaction
    assert_eq!(scan_keys(&mut reader, "t"), vec![1]);
    reader.commit().unwrap();
    assert_eq!(scan_keys(&mut reader, "t"), vec![1, 2]);
}

#[test]
fn test_second_writer_gets_busy() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    engine.begin_write().unwrap();

    let mut second = db
        .open_second(EngineConfig {
            busy_timeout_ms: 0,
            ..EngineConfig::default()
        })
        .unwrap();
    let err = second.begin_write().unwrap_err();
    assert!(matches!(err, DatabaseError::Busy { .. }));

    let engine = db.get_engine().unwrap();
    engine.rollback().unwrap();
    second.begin_write().unwrap();
    second.rollback().unwrap();
}

#[test]
fn test_drop_tree_recycles_pages() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("big", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    engine.begin_write().unwrap();
    for key in 0..500i64 {
        let payload = Record::new(vec![Value::Text(format!("{:0>100}", key))]);
        engine.insert("big", Value::Integer(key), payload).unwrap();
    }
    engine.commit().unwrap();
    let page_count = match engine.pragma_get("page_count").unwrap() {
        Value::Integer(n) => n,
        other => panic!("unexpected {:?}", other),
    };
    assert!(page_count > 10);

    engine.drop_tree("big").unwrap();
    let freelist = match engine.pragma_get("freelist_count").unwrap() {
        Value::Integer(n) => n,
        other => panic!("unexpected {:?}", other),
    };
    assert!(freelist > 0);
    assert!(engine.tree_names().is_empty());

    // New allocations come out of the freelist, not the file tail
    engine
        .create_tree("small", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    engine.insert("small", Value::Integer(1), create_test_record(1)).unwrap();
    let after = match engine.pragma_get("page_count").unwrap() {
        Value::Integer(n) => n,
        other => panic!("unexpected {:?}", other),
    };
    assert!(after <= page_count);
}

#[test]
fn test_incremental_vacuum_reclaims_tail_pages() {
    let mut db = TempDatabase::new();
    let engine = db
        .create_engine_with(EngineConfig {
            wal_autocheckpoint: 0,
            ..EngineConfig::default()
        })
        .unwrap();
    engine.pragma_set("auto_vacuum", "incremental").unwrap();
    engine
        .create_tree("big", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    engine.begin_write().unwrap();
    for key in 0..500i64 {
        let payload = Record::new(vec![Value::Text(format!("{:0>100}", key))]);
        engine.insert("big", Value::Integer(key), payload).unwrap();
    }
    engine.commit().unwrap();
    engine.drop_tree("big").unwrap();

    let before = match engine.pragma_get("freelist_count").unwrap() {
        Value::Integer(n) => n,
        other => panic!("unexpected {:?}", other),
    };
    assert!(before > 0);
    let reclaimed = engine.incremental_vacuum(0).unwrap();
    assert!(reclaimed > 0);
    let after = match engine.pragma_get("freelist_count").unwrap() {
        Value::Integer(n) => n,
        other => panic!("unexpected {:?}", other),
    };
    assert!(after < before);
}

#[test]
fn test_checkpoint_empties_log_and_preserves_data() {
    let mut db = TempDatabase::new();
    let config = EngineConfig {
        wal_autocheckpoint: 0,
        ..EngineConfig::default()
    };
    let engine = db.create_engine_with(config.clone()).unwrap();
    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    for key in 0..20i64 {
        engine.insert("t", Value::Integer(key), create_test_record(key)).unwrap();
    }
    let pages = engine.checkpoint().unwrap();
    assert!(pages > 0);

    db.close_engine();
    let engine = db.create_engine_with(config).unwrap();
    assert_eq!(scan_keys(engine, "t"), (0..20).collect::<Vec<_>>());
}

#[test]
fn test_checkpoint_rejected_inside_transaction() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine.begin_read().unwrap();
    assert!(matches!(
        engine.checkpoint().unwrap_err(),
        DatabaseError::Misuse { .. }
    ));
    engine.commit().unwrap();
}

#[test]
fn test_pragma_round_trips() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();

    assert_eq!(
        engine.pragma_get("journal_mode").unwrap(),
        Value::Text("wal".to_string())
    );
    assert_eq!(
        engine.pragma_set("busy_timeout", "250").unwrap(),
        Value::Integer(250)
    );
    assert_eq!(engine.pragma_get("busy_timeout").unwrap(), Value::Integer(250));

    engine.pragma_set("user_version", "7").unwrap();
    assert_eq!(engine.pragma_get("user_version").unwrap(), Value::Integer(7));

    assert_eq!(engine.pragma_get("page_size").unwrap(), Value::Integer(4096));
    assert!(engine.pragma_set("page_size", "8192").is_err());
    assert!(engine.pragma_set("schema_version", "3").is_err());
    assert!(engine.pragma_get("no_such_pragma").is_err());

    engine.pragma_set("foreign_keys", "on").unwrap();
    assert_eq!(engine.pragma_get("foreign_keys").unwrap(), Value::Integer(1));
}

#[test]
fn test_user_version_survives_reopen() {
    let mut db = TempDatabase::new();
    {
        let engine = db.create_engine().unwrap();
        engine.pragma_set("user_version", "42").unwrap();
    }
    db.close_engine();
    let engine = db.create_engine().unwrap();
    assert_eq!(engine.pragma_get("user_version").unwrap(), Value::Integer(42));
}

#[test]
fn test_schema_version_bumps_on_ddl() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    let before = engine.pragma_get("schema_version").unwrap();
    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    let after = engine.pragma_get("schema_version").unwrap();
    assert_ne!(before, after);
}

#[test]
fn test_journal_mode_switch_persists() {
    let mut db = TempDatabase::new();
    {
        let engine = db.create_engine().unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();
        assert_eq!(
            engine.pragma_set("journal_mode", "truncate").unwrap(),
            Value::Text("truncate".to_string())
        );
    }
    db.close_engine();
    let engine = db.create_engine().unwrap();
    assert_eq!(
        engine.pragma_get("journal_mode").unwrap(),
        Value::Text("truncate".to_string())
    );
    assert_eq!(scan_keys(engine, "t"), vec![1]);
}

#[test]
fn test_journal_mode_off_commits_straight_through() {
    let mut db = TempDatabase::new();
    let config = EngineConfig {
        journal_mode: JournalMode::Off,
        ..EngineConfig::default()
    };
    {
        let engine = db.create_engine_with(config.clone()).unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();
    }
    db.close_engine();
    let engine = db.create_engine_with(config).unwrap();
    assert_eq!(scan_keys(engine, "t"), vec![1]);
}

#[test]
fn test_encrypted_database_requires_the_right_key() {
    let mut db = TempDatabase::new();
    {
        let engine = db.create_engine_with(encrypted_config(b"correct horse")).unwrap();
        engine
            .create_tree("secrets", DataType::Text, DuplicatePolicy::Reject)
            .unwrap();
        engine
            .insert(
                "secrets",
                Value::Text("needle".to_string()),
                Record::new(vec![Value::Text("plaintext-needle-payload".to_string())]),
            )
            .unwrap();
        engine.checkpoint().unwrap();
    }
    db.close_engine();

    // No key at all
    let err = db.open_second(EngineConfig::default()).unwrap_err();
    assert!(err.to_string().contains("key is required"));
    // Wrong key fails authentication
    assert!(db.open_second(encrypted_config(b"wrong key")).is_err());

    // The raw file never contains the plaintext payload
    let raw = std::fs::read(&db.path).unwrap();
    let needle = b"plaintext-needle-payload";
    assert!(!raw.windows(needle.len()).any(|w| w == needle));

    let mut engine = db.open_second(encrypted_config(b"correct horse")).unwrap();
    let record = engine
        .lookup("secrets", &Value::Text("needle".to_string()))
        .unwrap()
        .unwrap();
    assert_eq!(
        record.get_value(0),
        Some(&Value::Text("plaintext-needle-payload".to_string()))
    );
}

#[test]
fn test_open_with_key_provider() {
    use lumbung::storage::cipher::{KeyProvider, MemoryKeyProvider};

    let db = TempDatabase::new();
    let file_name = db.path.file_name().unwrap().to_str().unwrap().to_string();
    let mut provider = MemoryKeyProvider::new();
    provider.put_key(&file_name, b"provider key").unwrap();

    {
        let mut engine = lumbung::engine::Engine::open_with_provider(
            &db.path,
            EngineConfig::default(),
            &provider,
        )
        .unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();
    }

    // Unknown file name: no key, so the open is rejected
    let fresh = MemoryKeyProvider::new();
    assert!(
        lumbung::engine::Engine::open_with_provider(
            &db.path,
            EngineConfig::default(),
            &fresh,
        )
        .is_err()
    );

    let mut engine = lumbung::engine::Engine::open_with_provider(
        &db.path,
        EngineConfig::default(),
        &provider,
    )
    .unwrap();
    assert!(engine.lookup("t", &Value::Integer(1)).unwrap().is_some());
}

#[test]
fn test_key_on_plaintext_database_is_rejected() {
    let mut db = TempDatabase::new();
    {
        db.create_engine().unwrap();
    }
    db.close_engine();
    let err = db.open_second(encrypted_config(b"some key")).unwrap_err();
    assert!(err.to_string().contains("unencrypted"));
}

#[test]
fn test_encrypted_crash_recovery_reads_log_without_plaintext() {
    let mut db = TempDatabase::new();
    let config = EngineConfig {
        wal_autocheckpoint: 0,
        key: Some(b"k1".to_vec()),
        ..EngineConfig::default()
    };
    {
        let engine = db.create_engine_with(config.clone()).unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        for key in 0..10i64 {
            let payload = Record::new(vec![Value::Text(format!(
                "wal-needle-payload-{:0>4}",
                key
            ))]);
            engine.insert("t", Value::Integer(key), payload).unwrap();
        }
    }
    let engine = db.engine.take().unwrap();
    std::mem::forget(engine);

    // Log frames carry ciphertext
    let wal_path = format!("{}-wal", db.path.display());
    let raw = std::fs::read(&wal_path).unwrap();
    let needle = b"wal-needle-payload";
    assert!(!raw.windows(needle.len()).any(|w| w == needle));

    let engine = db.create_engine_with(config).unwrap();
    assert_eq!(scan_keys(engine, "t"), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_rekey_switches_keys_atomically() {
    let mut db = TempDatabase::new();
    {
        let engine = db.create_engine_with(encrypted_config(b"old key")).unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        for key in 0..30i64 {
            engine.insert("t", Value::Integer(key), create_test_record(key)).unwrap();
        }
        let pages = engine.rekey(b"new key").unwrap();
        assert!(pages > 0);
        // The same connection keeps working under the new key
        assert_eq!(scan_keys(engine, "t"), (0..30).collect::<Vec<_>>());
    }
    db.close_engine();

    assert!(db.open_second(encrypted_config(b"old key")).is_err());
    let mut engine = db.open_second(encrypted_config(b"new key")).unwrap();
    assert_eq!(scan_keys(&mut engine, "t"), (0..30).collect::<Vec<_>>());
}

#[test]
fn test_interrupted_rekey_recovers_under_the_new_key() {
    let mut db = TempDatabase::new();
    {
        let engine = db.create_engine_with(encrypted_config(b"old key")).unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        for key in 0..20i64 {
            engine.insert("t", Value::Integer(key), create_test_record(key)).unwrap();
        }
        engine.checkpoint().unwrap();
    }
    db.close_engine();

    // Replay the rekey protocol up to its commit marker, then stop: the
    // main file still carries the old salt while the log holds every page
    // re-encrypted under the new one.
    let raw_header = std::fs::read(&db.path).unwrap();
    let mut header = DbHeader::from_bytes(&raw_header).unwrap();
    let old_cipher = PageCipher::derive(b"old key", header.cipher_salt);
    let new_salt = [7u8; 16];
    let new_cipher = PageCipher::derive(b"new key", new_salt);

    let mut store = PageStore::open(&db.path).unwrap();
    let wal_path = format!("{}-wal", db.path.display());
    let mut wal = Wal::open_file(&wal_path, JournalMode::Wal).unwrap();
    let txn_id = wal.last_committed_txn() + 1;
    for page_id in 1..header.page_count {
        let raw = store.read_page(page_id).unwrap();
        let plain = old_cipher.decrypt_page(page_id, &raw).unwrap();
        let image = new_cipher.encrypt_page(page_id, &plain).unwrap();
        wal.append_frame(txn_id, page_id, &image).unwrap();
    }
    header.cipher_salt = new_salt;
    header.change_counter += 1;
    let mut header_image = header.to_bytes();
    header_image.resize(PAGE_SIZE, 0);
    wal.append_frame(txn_id, 0, &header_image).unwrap();
    wal.commit(txn_id, header.page_count).unwrap();
    drop(wal);
    drop(store);

    // Exactly one key opens the database afterwards
    assert!(db.open_second(encrypted_config(b"old key")).is_err());
    let mut engine = db.open_second(encrypted_config(b"new key")).unwrap();
    assert_eq!(scan_keys(&mut engine, "t"), (0..20).collect::<Vec<_>>());
}

#[test]
fn test_rekey_requires_a_cipher() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    assert!(matches!(
        engine.rekey(b"k").unwrap_err(),
        DatabaseError::Configuration { .. }
    ));
}

#[test]
fn test_plaintext_header_window_readable_without_key() {
    let mut db = TempDatabase::new();
    let config = EngineConfig {
        key: Some(b"k".to_vec()),
        plaintext_header_size: 32,
        ..EngineConfig::default()
    };
    {
        let engine = db.create_engine_with(config.clone()).unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();
        engine.checkpoint().unwrap();
    }
    db.close_engine();
    let raw = std::fs::read(&db.path).unwrap();
    // Magic stays readable in the clear window
    assert_eq!(&raw[0..16], b"LUMBUNG DB v0.1\0");

    let mut engine = db.open_second(config).unwrap();
    assert_eq!(scan_keys(&mut engine, "t"), vec![1]);
}

#[test]
fn test_cipher_pragmas_round_trip() {
    let mut db = TempDatabase::new();
    let new_salt = "000102030405060708090a0b0c0d0e0f";
    {
        let engine = db.create_engine_with(encrypted_config(b"k")).unwrap();
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap();
        engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();

        let salt = match engine.pragma_get("cipher_salt").unwrap() {
            Value::Text(hex) => hex,
            other => panic!("unexpected salt value {:?}", other),
        };
        assert_eq!(salt.len(), 32);
        assert_ne!(salt, new_salt);

        // Writing the salt re-encrypts every page in place
        assert_eq!(
            engine.pragma_set("cipher_salt", new_salt).unwrap(),
            Value::Text(new_salt.to_string())
        );
        assert_eq!(scan_keys(engine, "t"), vec![1]);
        assert!(engine.pragma_set("cipher_salt", "not hex").is_err());

        assert_eq!(
            engine.pragma_set("plaintext_header_size", "24").unwrap(),
            Value::Integer(24)
        );
        assert!(engine.pragma_set("plaintext_header_size", "7").is_err());
    }
    db.close_engine();

    let mut engine = db.open_second(encrypted_config(b"k")).unwrap();
    assert_eq!(
        engine.pragma_get("cipher_salt").unwrap(),
        Value::Text(new_salt.to_string())
    );
    assert_eq!(
        engine.pragma_get("plaintext_header_size").unwrap(),
        Value::Integer(24)
    );
    assert_eq!(scan_keys(&mut engine, "t"), vec![1]);
}

#[test]
fn test_cipher_salt_pragma_requires_a_cipher() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    assert_eq!(engine.pragma_get("cipher_salt").unwrap(), Value::Null);
    assert!(matches!(
        engine
            .pragma_set("cipher_salt", "00112233445566778899aabbccddeeff")
            .unwrap_err(),
        DatabaseError::Configuration { .. }
    ));
}

#[test]
fn test_tree_name_and_key_constraints() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    assert!(engine
        .create_tree("__reserved", DataType::Integer, DuplicatePolicy::Reject)
        .is_err());
    assert!(engine
        .create_tree("", DataType::Integer, DuplicatePolicy::Reject)
        .is_err());

    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    assert!(matches!(
        engine
            .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
            .unwrap_err(),
        DatabaseError::TreeExists { .. }
    ));
    assert!(matches!(
        engine.insert("t", Value::Null, create_test_record(0)).unwrap_err(),
        DatabaseError::Misuse { .. }
    ));
    assert!(matches!(
        engine.lookup("missing", &Value::Integer(1)).unwrap_err(),
        DatabaseError::TreeNotFound { .. }
    ));
}

#[test]
fn test_keys_are_coerced_to_the_tree_key_type() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    engine
        .insert("t", Value::Text("7".to_string()), create_test_record(7))
        .unwrap();
    assert!(engine.lookup("t", &Value::Integer(7)).unwrap().is_some());
    assert!(engine.lookup("t", &Value::Real(7.0)).unwrap().is_some());
}

#[test]
fn test_data_version_advances_on_foreign_commit() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("t", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    let mut second = db.open_second(EngineConfig::default()).unwrap();
    let before = second.data_version();

    let engine = db.get_engine().unwrap();
    engine.insert("t", Value::Integer(1), create_test_record(1)).unwrap();

    second.begin_read().unwrap();
    second.commit().unwrap();
    assert!(second.data_version() > before);
}
