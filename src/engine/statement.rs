use crate::engine::{Engine, coerce_key};
use crate::storage::btree::{BTree, Cursor, DuplicatePolicy, TreeDef};
use crate::types::error::{DatabaseError, Result};
use crate::types::record::Record;
use crate::types::value::{DataType, Value};

/// A literal value or a reference to a bound parameter (1-based).
#[derive(Debug, Clone)]
pub enum Operand {
    Literal(Value),
    Param(usize),
}

#[derive(Debug, Clone)]
pub enum Bound {
    Unbounded,
    Included(Operand),
    Excluded(Operand),
}

/// One prepared operation. Scans emit one row per step; everything else
/// completes on the first step.
#[derive(Debug, Clone)]
pub enum Operation {
    CreateTree {
        tree: String,
        key_type: DataType,
        on_duplicate: DuplicatePolicy,
    },
    DropTree {
        tree: String,
    },
    Insert {
        tree: String,
        key: Operand,
        values: Vec<Operand>,
    },
    Delete {
        tree: String,
        key: Operand,
    },
    Lookup {
        tree: String,
        key: Operand,
    },
    Scan {
        tree: String,
        lower: Bound,
        upper: Bound,
        reverse: bool,
    },
    Aggregate {
        tree: String,
        function: String,
        /// Row column fed to the aggregate (0 is the key); `None` feeds no
        /// argument, as in `count(*)`.
        column: Option<usize>,
        lower: Bound,
        upper: Bound,
    },
    CallScalar {
        function: String,
        args: Vec<Operand>,
    },
}

impl Operation {
    fn max_param(&self) -> usize {
        fn operand(op: &Operand) -> usize {
            match op {
                Operand::Param(i) => *i,
                Operand::Literal(_) => 0,
            }
        }
        fn bound(b: &Bound) -> usize {
            match b {
                Bound::Unbounded => 0,
                Bound::Included(op) | Bound::Excluded(op) => operand(op),
            }
        }
        match self {
            Operation::CreateTree { .. } | Operation::DropTree { .. } => 0,
            Operation::Insert { key, values, .. } => values
                .iter()
                .map(operand)
                .chain([operand(key)])
                .max()
                .unwrap_or(0),
            Operation::Delete { key, .. } | Operation::Lookup { key, .. } => operand(key),
            Operation::Scan { lower, upper, .. }
            | Operation::Aggregate { lower, upper, .. } => bound(lower).max(bound(upper)),
            Operation::CallScalar { args, .. } => args.iter().map(operand).max().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementState {
    Ready,
    Running,
    Done,
    Finalized,
}

struct ScanState {
    def: TreeDef,
    cursor: Cursor,
    /// Stop bound in scan direction: the upper key going forward, the
    /// lower key going backward.
    end: Option<(Value, bool)>,
    reverse: bool,
}

/// A prepared statement handle. The lifecycle is prepare → bind → step*
/// → reset → … → finalize; after the last row, further steps keep
/// returning `Done` until an explicit reset.
pub struct Statement {
    operation: Operation,
    params: Vec<Option<Value>>,
    state: StatementState,
    scan: Option<ScanState>,
    row: Option<Record>,
    implicit_txn: bool,
}

impl Statement {
    /// Bind a parameter (1-based). Unbound parameters read as null.
    /// Binding is only legal before the first step or after a reset.
    pub fn bind(&mut self, index: usize, value: Value) -> Result<()> {
        if self.state != StatementState::Ready {
            return Err(DatabaseError::Misuse {
                reason: "bind on a running statement, reset it first".to_string(),
            });
        }
        if index == 0 || index > self.params.len() {
            return Err(DatabaseError::Misuse {
                reason: format!(
                    "parameter index {} out of range 1..={}",
                    index,
                    self.params.len()
                ),
            });
        }
        self.params[index - 1] = Some(value);
        Ok(())
    }

    pub fn clear_bindings(&mut self) -> Result<()> {
        if self.state != StatementState::Ready {
            return Err(DatabaseError::Misuse {
                reason: "clear_bindings on a running statement".to_string(),
            });
        }
        for slot in &mut self.params {
            *slot = None;
        }
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    /// Current row, if the last step produced one. Column 0 is the key;
    /// the record values follow.
    pub fn row(&self) -> Option<&Record> {
        self.row.as_ref()
    }

    pub fn column(&self, index: usize) -> Option<&Value> {
        self.row.as_ref().and_then(|r| r.get_value(index))
    }
}

fn resolve_operand(operand: &Operand, params: &[Option<Value>]) -> Result<Value> {
    match operand {
        Operand::Literal(value) => Ok(value.clone()),
        Operand::Param(index) => {
            if *index == 0 || *index > params.len() {
                return Err(DatabaseError::Misuse {
                    reason: format!("parameter index {} out of range", index),
                });
            }
            Ok(params[*index - 1].clone().unwrap_or(Value::Null))
        }
    }
}

fn resolve_bound(
    bound: &Bound,
    params: &[Option<Value>],
    key_type: DataType,
) -> Result<Option<(Value, bool)>> {
    let (operand, inclusive) = match bound {
        Bound::Unbounded => return Ok(None),
        Bound::Included(op) => (op, true),
        Bound::Excluded(op) => (op, false),
    };
    let value = resolve_operand(operand, params)?;
    Ok(Some((coerce_key(value, key_type)?, inclusive)))
}

fn row_of(key: Value, record: Record) -> Record {
    let mut values = Vec::with_capacity(1 + record.values.len());
    values.push(key);
    values.extend(record.values);
    Record::new(values)
}

impl Engine {
    pub fn prepare(&self, operation: Operation) -> Result<Statement> {
        let params = operation.max_param();
        Ok(Statement {
            operation,
            params: vec![None; params],
            state: StatementState::Ready,
            scan: None,
            row: None,
            implicit_txn: false,
        })
    }

    /// Advance the statement: `Row` when a result row is available,
    /// `Done` when the statement has finished.
    pub fn step(&mut self, stmt: &mut Statement) -> Result<StepResult> {
        match stmt.state {
            StatementState::Finalized => Err(DatabaseError::Misuse {
                reason: "step on a finalized statement".to_string(),
            }),
            StatementState::Done => Ok(StepResult::Done),
            StatementState::Ready => {
                let result = self
                    .check_interrupt()
                    .and_then(|()| self.start_statement(stmt));
                self.conclude(stmt, result)
            }
            StatementState::Running => {
                let result = self
                    .check_interrupt()
                    .and_then(|()| self.advance_statement(stmt));
                self.conclude(stmt, result)
            }
        }
    }

    /// Rewind the statement for re-execution. Bindings are kept.
    pub fn reset(&mut self, stmt: &mut Statement) -> Result<()> {
        if stmt.state == StatementState::Finalized {
            return Err(DatabaseError::Misuse {
                reason: "reset on a finalized statement".to_string(),
            });
        }
        self.close_statement_txn(stmt)?;
        stmt.scan = None;
        stmt.row = None;
        stmt.state = StatementState::Ready;
        Ok(())
    }

    pub fn finalize(&mut self, stmt: &mut Statement) -> Result<()> {
        if stmt.state == StatementState::Finalized {
            return Ok(());
        }
        self.close_statement_txn(stmt)?;
        stmt.scan = None;
        stmt.row = None;
        stmt.state = StatementState::Finalized;
        Ok(())
    }

    fn close_statement_txn(&mut self, stmt: &mut Statement) -> Result<()> {
        if stmt.implicit_txn {
            stmt.implicit_txn = false;
            if self.in_transaction() {
                self.commit()?;
            }
        }
        Ok(())
    }

    fn conclude(&mut self, stmt: &mut Statement, result: Result<StepResult>) -> Result<StepResult> {
        match result {
            Ok(StepResult::Row) => {
                stmt.state = StatementState::Running;
                Ok(StepResult::Row)
            }
            Ok(StepResult::Done) => {
                stmt.state = StatementState::Done;
                stmt.row = None;
                stmt.scan = None;
                self.close_statement_txn(stmt)?;
                Ok(StepResult::Done)
            }
            Err(e) => {
                stmt.state = StatementState::Done;
                stmt.row = None;
                stmt.scan = None;
                if stmt.implicit_txn {
                    stmt.implicit_txn = false;
                    if self.in_transaction() {
                        let _ = self.rollback();
                    }
                } else if e.is_transaction_fatal() && self.in_transaction() {
                    // A fatal error poisons the surrounding transaction.
                    let _ = self.rollback();
                }
                Err(e)
            }
        }
    }

    fn start_statement(&mut self, stmt: &mut Statement) -> Result<StepResult> {
        let operation = stmt.operation.clone();
        match operation {
            Operation::CreateTree {
                tree,
                key_type,
                on_duplicate,
            } => {
                self.create_tree(&tree, key_type, on_duplicate)?;
                Ok(StepResult::Done)
            }
            Operation::DropTree { tree } => {
                self.drop_tree(&tree)?;
                Ok(StepResult::Done)
            }
            Operation::Insert { tree, key, values } => {
                let key = resolve_operand(&key, &stmt.params)?;
                let values = values
                    .iter()
                    .map(|op| resolve_operand(op, &stmt.params))
                    .collect::<Result<Vec<_>>>()?;
                self.insert(&tree, key, Record::new(values))?;
                Ok(StepResult::Done)
            }
            Operation::Delete { tree, key } => {
                let key = resolve_operand(&key, &stmt.params)?;
                self.delete(&tree, &key)?;
                Ok(StepResult::Done)
            }
            Operation::Lookup { tree, key } => {
                let key = resolve_operand(&key, &stmt.params)?;
                let def = self.txn_tree(&tree)?;
                let key = coerce_key(key, def.key_type)?;
                match self.lookup(&tree, &key)? {
                    Some(record) => {
                        stmt.row = Some(row_of(key, record));
                        Ok(StepResult::Row)
                    }
                    None => Ok(StepResult::Done),
                }
            }
            Operation::Scan {
                tree,
                lower,
                upper,
                reverse,
            } => {
                let scan = self.open_scan(stmt, &tree, &lower, &upper, reverse)?;
                stmt.scan = Some(scan);
                self.emit_current(stmt)
            }
            Operation::Aggregate {
                tree,
                function,
                column,
                lower,
                upper,
            } => {
                let mut scan = self.open_scan(stmt, &tree, &lower, &upper, false)?;
                let mut accumulator = self.functions.new_accumulator(&function)?;
                loop {
                    self.check_interrupt()?;
                    let Some((key, record)) = self.current_scan_row(&mut scan)? else {
                        break;
                    };
                    match column {
                        None => accumulator.step(&[])?,
                        Some(index) => {
                            let row = row_of(key, record);
                            let value = row.get_value(index).cloned().unwrap_or(Value::Null);
                            accumulator.step(&[value])?;
                        }
                    }
                    if !self.advance_cursor(&mut scan)? {
                        break;
                    }
                }
                self.close_statement_txn(stmt)?;
                stmt.row = Some(Record::new(vec![accumulator.finish()?]));
                Ok(StepResult::Row)
            }
            Operation::CallScalar { function, args } => {
                let args = args
                    .iter()
                    .map(|op| resolve_operand(op, &stmt.params))
                    .collect::<Result<Vec<_>>>()?;
                let value = self.functions.call_scalar(&function, &args)?;
                stmt.row = Some(Record::new(vec![value]));
                Ok(StepResult::Row)
            }
        }
    }

    fn advance_statement(&mut self, stmt: &mut Statement) -> Result<StepResult> {
        let Some(scan) = stmt.scan.as_mut() else {
            // Single-row operation already delivered its row.
            return Ok(StepResult::Done);
        };
        if scan.cursor.epoch != self.structural_epoch {
            return Err(DatabaseError::CursorInvalidated);
        }
        let btree = BTree::new(scan.def.clone());
        let moved = {
            let mut pager = self.pager()?;
            if scan.reverse {
                btree.cursor_previous(&mut pager, &mut scan.cursor)?
            } else {
                btree.cursor_next(&mut pager, &mut scan.cursor)?
            }
        };
        if !moved {
            return Ok(StepResult::Done);
        }
        self.emit_current(stmt)
    }

    fn open_scan(
        &mut self,
        stmt: &mut Statement,
        tree: &str,
        lower: &Bound,
        upper: &Bound,
        reverse: bool,
    ) -> Result<ScanState> {
        if !self.in_transaction() {
            self.begin_read()?;
            stmt.implicit_txn = true;
        }
        let def = self.txn_tree(tree)?;
        let lower = resolve_bound(lower, &stmt.params, def.key_type)?;
        let upper = resolve_bound(upper, &stmt.params, def.key_type)?;
        let epoch = self.structural_epoch;
        let btree = BTree::new(def.clone());
        let mut pager = self.pager()?;

        let cursor = if reverse {
            match &upper {
                None => btree.last(&mut pager, epoch)?,
                Some((key, inclusive)) => {
                    let mut cursor = btree.seek(&mut pager, key, epoch)?;
                    if cursor.exhausted {
                        // Every entry is below the bound.
                        btree.last(&mut pager, epoch)?
                    } else {
                        let at_bound = btree
                            .cursor_current(&mut pager, &cursor)?
                            .map(|(k, _)| k.key_cmp(key) == std::cmp::Ordering::Equal)
                            .unwrap_or(false);
                        if !(at_bound && *inclusive) {
                            btree.cursor_previous(&mut pager, &mut cursor)?;
                        }
                        cursor
                    }
                }
            }
        } else {
            match &lower {
                None => btree.first(&mut pager, epoch)?,
                Some((key, inclusive)) => {
                    let mut cursor = btree.seek(&mut pager, key, epoch)?;
                    if !inclusive {
                        let at_bound = btree
                            .cursor_current(&mut pager, &cursor)?
                            .map(|(k, _)| k.key_cmp(key) == std::cmp::Ordering::Equal)
                            .unwrap_or(false);
                        if at_bound {
                            btree.cursor_next(&mut pager, &mut cursor)?;
                        }
                    }
                    cursor
                }
            }
        };

        let end = if reverse { lower } else { upper };
        Ok(ScanState {
            def,
            cursor,
            end,
            reverse,
        })
    }

    /// Entry under the scan cursor, unless the cursor is exhausted or has
    /// run past the stop bound.
    fn current_scan_row(&mut self, scan: &mut ScanState) -> Result<Option<(Value, Record)>> {
        let btree = BTree::new(scan.def.clone());
        let mut pager = self.pager()?;
        let Some((key, record)) = btree.cursor_current(&mut pager, &scan.cursor)? else {
            return Ok(None);
        };
        if let Some((bound, inclusive)) = &scan.end {
            let past = match key.key_cmp(bound) {
                std::cmp::Ordering::Equal => !*inclusive,
                std::cmp::Ordering::Greater => !scan.reverse,
                std::cmp::Ordering::Less => scan.reverse,
            };
            if past {
                return Ok(None);
            }
        }
        Ok(Some((key, record)))
    }

    fn advance_cursor(&mut self, scan: &mut ScanState) -> Result<bool> {
        let btree = BTree::new(scan.def.clone());
        let mut pager = self.pager()?;
        if scan.reverse {
            btree.cursor_previous(&mut pager, &mut scan.cursor)
        } else {
            btree.cursor_next(&mut pager, &mut scan.cursor)
        }
    }

    fn emit_current(&mut self, stmt: &mut Statement) -> Result<StepResult> {
        let Some(mut scan) = stmt.scan.take() else {
            return Ok(StepResult::Done);
        };
        let row = self.current_scan_row(&mut scan)?;
        stmt.scan = Some(scan);
        match row {
            Some((key, record)) => {
                stmt.row = Some(row_of(key, record));
                Ok(StepResult::Row)
            }
            None => Ok(StepResult::Done),
        }
    }
}
