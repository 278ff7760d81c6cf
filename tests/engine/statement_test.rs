use lumbung::engine::statement::{Bound, Operand, Operation, StepResult};
use lumbung::storage::btree::DuplicatePolicy;
use lumbung::types::error::DatabaseError;
use lumbung::types::value::{DataType, Value};
use lumbung::utils::mock::{TempDatabase, create_test_record};

fn seeded_db() -> TempDatabase {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("items", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();
    for key in 1..=10i64 {
        engine
            .insert("items", Value::Integer(key), create_test_record(key))
            .unwrap();
    }
    db
}

fn full_scan(reverse: bool) -> Operation {
    Operation::Scan {
        tree: "items".to_string(),
        lower: Bound::Unbounded,
        upper: Bound::Unbounded,
        reverse,
    }
}

#[test]
fn test_insert_statement_with_parameters() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    engine
        .create_tree("items", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();

    let mut stmt = engine
        .prepare(Operation::Insert {
            tree: "items".to_string(),
            key: Operand::Param(1),
            values: vec![Operand::Param(2)],
        })
        .unwrap();
    assert_eq!(stmt.parameter_count(), 2);

    for key in 1..=3i64 {
        stmt.bind(1, Value::Integer(key)).unwrap();
        stmt.bind(2, Value::Text(format!("row{}", key))).unwrap();
        assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Done);
        engine.reset(&mut stmt).unwrap();
    }
    engine.finalize(&mut stmt).unwrap();

    for key in 1..=3i64 {
        let record = engine.lookup("items", &Value::Integer(key)).unwrap().unwrap();
        assert_eq!(record.get_value(0), Some(&Value::Text(format!("row{}", key))));
    }
}

#[test]
fn test_bind_outside_ready_state_is_misuse() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine.prepare(full_scan(false)).unwrap();
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);
    assert!(matches!(
        stmt.bind(1, Value::Integer(1)).unwrap_err(),
        DatabaseError::Misuse { .. }
    ));
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_bind_out_of_range_is_misuse() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine
        .prepare(Operation::Lookup {
            tree: "items".to_string(),
            key: Operand::Param(1),
        })
        .unwrap();
    assert!(stmt.bind(0, Value::Integer(1)).is_err());
    assert!(stmt.bind(2, Value::Integer(1)).is_err());
    stmt.bind(1, Value::Integer(1)).unwrap();
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_full_scan_emits_rows_in_key_order() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine.prepare(full_scan(false)).unwrap();
    let mut rows = Vec::new();
    while engine.step(&mut stmt).unwrap() == StepResult::Row {
        let key = stmt.column(0).cloned().unwrap();
        let value = stmt.column(1).cloned().unwrap();
        rows.push((key, value));
    }
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0].0, Value::Integer(1));
    assert_eq!(rows[0].1, Value::Text("v1".to_string()));
    assert_eq!(rows[9].0, Value::Integer(10));

    // Steps after Done keep returning Done
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Done);
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Done);
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_reverse_scan() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine.prepare(full_scan(true)).unwrap();
    let mut keys = Vec::new();
    while engine.step(&mut stmt).unwrap() == StepResult::Row {
        if let Some(Value::Integer(n)) = stmt.column(0) {
            keys.push(*n);
        }
    }
    assert_eq!(keys, (1..=10i64).rev().collect::<Vec<_>>());
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_scan_bounds() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();

    let collect = |engine: &mut lumbung::engine::Engine, lower: Bound, upper: Bound, reverse| {
        let mut stmt = engine
            .prepare(Operation::Scan {
                tree: "items".to_string(),
                lower,
                upper,
                reverse,
            })
            .unwrap();
        let mut keys = Vec::new();
        while engine.step(&mut stmt).unwrap() == StepResult::Row {
            if let Some(Value::Integer(n)) = stmt.column(0) {
                keys.push(*n);
            }
        }
        engine.finalize(&mut stmt).unwrap();
        keys
    };

    let lit = |n: i64| Operand::Literal(Value::Integer(n));
    assert_eq!(
        collect(engine, Bound::Included(lit(3)), Bound::Included(lit(6)), false),
        vec![3, 4, 5, 6]
    );
    assert_eq!(
        collect(engine, Bound::Excluded(lit(3)), Bound::Excluded(lit(6)), false),
        vec![4, 5]
    );
    assert_eq!(
        collect(engine, Bound::Included(lit(8)), Bound::Unbounded, false),
        vec![8, 9, 10]
    );
    assert_eq!(
        collect(engine, Bound::Unbounded, Bound::Excluded(lit(3)), false),
        vec![1, 2]
    );
    // Reverse honors the same bounds, emitting descending keys
    assert_eq!(
        collect(engine, Bound::Included(lit(3)), Bound::Included(lit(6)), true),
        vec![6, 5, 4, 3]
    );
    assert_eq!(
        collect(engine, Bound::Excluded(lit(3)), Bound::Excluded(lit(6)), true),
        vec![5, 4]
    );
    // Empty window
    assert_eq!(
        collect(engine, Bound::Excluded(lit(5)), Bound::Excluded(lit(6)), false),
        Vec::<i64>::new()
    );
}

#[test]
fn test_scan_bound_parameters_are_coerced() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine
        .prepare(Operation::Scan {
            tree: "items".to_string(),
            lower: Bound::Included(Operand::Param(1)),
            upper: Bound::Included(Operand::Param(2)),
            reverse: false,
        })
        .unwrap();
    stmt.bind(1, Value::Text("4".to_string())).unwrap();
    stmt.bind(2, Value::Real(7.0)).unwrap();
    let mut keys = Vec::new();
    while engine.step(&mut stmt).unwrap() == StepResult::Row {
        if let Some(Value::Integer(n)) = stmt.column(0) {
            keys.push(*n);
        }
    }
    assert_eq!(keys, vec![4, 5, 6, 7]);
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_reset_reruns_with_kept_bindings() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine
        .prepare(Operation::Lookup {
            tree: "items".to_string(),
            key: Operand::Param(1),
        })
        .unwrap();
    stmt.bind(1, Value::Integer(5)).unwrap();

    for _ in 0..2 {
        assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);
        assert_eq!(stmt.column(1), Some(&Value::Text("v5".to_string())));
        assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Done);
        engine.reset(&mut stmt).unwrap();
    }
    stmt.clear_bindings().unwrap();
    // An unbound parameter reads as null, which a lookup rejects as a key
    assert!(engine.step(&mut stmt).unwrap_err().to_string().contains("null"));
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_step_after_finalize_is_misuse() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine.prepare(full_scan(false)).unwrap();
    engine.finalize(&mut stmt).unwrap();
    assert!(matches!(
        engine.step(&mut stmt).unwrap_err(),
        DatabaseError::Misuse { .. }
    ));
}

#[test]
fn test_lookup_miss_is_done_without_row() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine
        .prepare(Operation::Lookup {
            tree: "items".to_string(),
            key: Operand::Literal(Value::Integer(99)),
        })
        .unwrap();
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Done);
    assert!(stmt.row().is_none());
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_ddl_statements() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();
    let mut create = engine
        .prepare(Operation::CreateTree {
            tree: "t".to_string(),
            key_type: DataType::Text,
            on_duplicate: DuplicatePolicy::Overwrite,
        })
        .unwrap();
    assert_eq!(engine.step(&mut create).unwrap(), StepResult::Done);
    engine.finalize(&mut create).unwrap();
    assert_eq!(engine.tree_names(), vec!["t".to_string()]);

    let mut drop = engine
        .prepare(Operation::DropTree {
            tree: "t".to_string(),
        })
        .unwrap();
    assert_eq!(engine.step(&mut drop).unwrap(), StepResult::Done);
    engine.finalize(&mut drop).unwrap();
    assert!(engine.tree_names().is_empty());
}

#[test]
fn test_delete_statement() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine
        .prepare(Operation::Delete {
            tree: "items".to_string(),
            key: Operand::Literal(Value::Integer(5)),
        })
        .unwrap();
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Done);
    engine.finalize(&mut stmt).unwrap();
    assert!(engine.lookup("items", &Value::Integer(5)).unwrap().is_none());
}

#[test]
fn test_aggregates_over_scans() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();

    let run = |engine: &mut lumbung::engine::Engine, function: &str, column: Option<usize>| {
        let mut stmt = engine
            .prepare(Operation::Aggregate {
                tree: "items".to_string(),
                function: function.to_string(),
                column,
                lower: Bound::Unbounded,
                upper: Bound::Unbounded,
            })
            .unwrap();
        assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);
        let result = stmt.column(0).cloned().unwrap();
        assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Done);
        engine.finalize(&mut stmt).unwrap();
        result
    };

    assert_eq!(run(engine, "count", None), Value::Integer(10));
    assert_eq!(run(engine, "count", Some(1)), Value::Integer(10));
    assert_eq!(run(engine, "sum", Some(0)), Value::Integer(55));
    assert_eq!(run(engine, "avg", Some(0)), Value::Real(5.5));
    assert_eq!(run(engine, "min", Some(0)), Value::Integer(1));
    assert_eq!(run(engine, "max", Some(0)), Value::Integer(10));
    // Case-insensitive lookup
    assert_eq!(run(engine, "SUM", Some(0)), Value::Integer(55));
}

#[test]
fn test_aggregate_over_bounded_window() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let mut stmt = engine
        .prepare(Operation::Aggregate {
            tree: "items".to_string(),
            function: "sum".to_string(),
            column: Some(0),
            lower: Bound::Included(Operand::Literal(Value::Integer(4))),
            upper: Bound::Excluded(Operand::Literal(Value::Integer(7))),
        })
        .unwrap();
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);
    assert_eq!(stmt.column(0), Some(&Value::Integer(15)));
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_scalar_call_and_registration() {
    let mut db = TempDatabase::new();
    let engine = db.create_engine().unwrap();

    let mut stmt = engine
        .prepare(Operation::CallScalar {
            function: "upper".to_string(),
            args: vec![Operand::Literal(Value::Text("abc".to_string()))],
        })
        .unwrap();
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);
    assert_eq!(stmt.column(0), Some(&Value::Text("ABC".to_string())));
    engine.finalize(&mut stmt).unwrap();

    engine.register_scalar(
        "double",
        Box::new(|args| {
            let n = args
                .first()
                .cloned()
                .unwrap_or(Value::Null)
                .coerce(DataType::Integer)?;
            match n {
                Value::Integer(n) => Ok(Value::Integer(n * 2)),
                other => Ok(other),
            }
        }),
    );
    let mut stmt = engine
        .prepare(Operation::CallScalar {
            function: "double".to_string(),
            args: vec![Operand::Param(1)],
        })
        .unwrap();
    stmt.bind(1, Value::Integer(21)).unwrap();
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);
    assert_eq!(stmt.column(0), Some(&Value::Integer(42)));
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_panicking_function_fails_only_the_statement() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    engine.register_scalar("boom", Box::new(|_| panic!("bad function")));

    engine.begin_write().unwrap();
    engine
        .insert("items", Value::Integer(11), create_test_record(11))
        .unwrap();

    let mut stmt = engine
        .prepare(Operation::CallScalar {
            function: "boom".to_string(),
            args: vec![],
        })
        .unwrap();
    assert!(matches!(
        engine.step(&mut stmt).unwrap_err(),
        DatabaseError::FunctionFailure { .. }
    ));
    engine.finalize(&mut stmt).unwrap();

    // The enclosing transaction survived the statement failure
    assert!(engine.in_transaction());
    engine.commit().unwrap();
    assert!(engine.lookup("items", &Value::Integer(11)).unwrap().is_some());
}

#[test]
fn test_duplicate_key_is_statement_level() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    engine.begin_write().unwrap();
    engine
        .insert("items", Value::Integer(20), create_test_record(20))
        .unwrap();

    let mut stmt = engine
        .prepare(Operation::Insert {
            tree: "items".to_string(),
            key: Operand::Literal(Value::Integer(5)),
            values: vec![Operand::Literal(Value::Text("clash".to_string()))],
        })
        .unwrap();
    assert!(matches!(
        engine.step(&mut stmt).unwrap_err(),
        DatabaseError::DuplicateKey { .. }
    ));
    engine.finalize(&mut stmt).unwrap();

    assert!(engine.in_transaction());
    engine.commit().unwrap();
    assert!(engine.lookup("items", &Value::Integer(20)).unwrap().is_some());
    // The clashing insert changed nothing
    let record = engine.lookup("items", &Value::Integer(5)).unwrap().unwrap();
    assert_eq!(record.get_value(0), Some(&Value::Text("v5".to_string())));
}

#[test]
fn test_write_statement_in_read_transaction_fails() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    engine.begin_read().unwrap();
    let mut stmt = engine
        .prepare(Operation::Insert {
            tree: "items".to_string(),
            key: Operand::Literal(Value::Integer(50)),
            values: vec![],
        })
        .unwrap();
    assert!(engine.step(&mut stmt).is_err());
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_interrupt_aborts_a_running_scan() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    let handle = engine.interrupt_handle();

    let mut stmt = engine.prepare(full_scan(false)).unwrap();
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);
    handle.interrupt();
    assert!(matches!(
        engine.step(&mut stmt).unwrap_err(),
        DatabaseError::Interrupted
    ));
    engine.reset(&mut stmt).unwrap();

    // The flag clears once delivered; the statement runs again
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);
    engine.finalize(&mut stmt).unwrap();
}

#[test]
fn test_structural_change_invalidates_open_scan() {
    let mut db = seeded_db();
    let engine = db.get_engine().unwrap();
    engine
        .create_tree("other", DataType::Integer, DuplicatePolicy::Reject)
        .unwrap();

    engine.begin_write().unwrap();
    let mut stmt = engine.prepare(full_scan(false)).unwrap();
    assert_eq!(engine.step(&mut stmt).unwrap(), StepResult::Row);

    // Dropping a tree inside the same transaction shifts pages around
    engine.drop_tree("other").unwrap();
    assert!(matches!(
        engine.step(&mut stmt).unwrap_err(),
        DatabaseError::CursorInvalidated
    ));
    engine.finalize(&mut stmt).unwrap();
    engine.rollback().unwrap();
}
