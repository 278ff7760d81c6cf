use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::types::error::{DatabaseError, Result};
use crate::types::value::{DataType, Value};

pub type ScalarFn = Box<dyn Fn(&[Value]) -> Result<Value> + Send>;

/// One running aggregate: `step` folds a row in, `finish` yields the
/// result. A fresh accumulator is built per statement execution, so
/// aggregate functions carry no cross-statement state.
pub trait Accumulator: Send {
    fn step(&mut self, args: &[Value]) -> Result<()>;
    fn finish(&mut self) -> Result<Value>;
}

pub type AccumulatorFactory = Box<dyn Fn() -> Box<dyn Accumulator> + Send>;

/// Per-connection function registry. Built-ins are registered up front;
/// embedders may add or shadow entries by name. Lookups are
/// case-insensitive.
pub struct FunctionRegistry {
    scalars: HashMap<String, ScalarFn>,
    aggregates: HashMap<String, AccumulatorFactory>,
}

impl FunctionRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            scalars: HashMap::new(),
            aggregates: HashMap::new(),
        };
        registry.register_scalar("abs", Box::new(scalar_abs));
        registry.register_scalar("length", Box::new(scalar_length));
        registry.register_scalar("upper", Box::new(scalar_upper));
        registry.register_scalar("lower", Box::new(scalar_lower));
        registry.register_scalar("coalesce", Box::new(scalar_coalesce));
        registry.register_scalar("typeof", Box::new(scalar_typeof));
        registry.register_aggregate("count", Box::new(|| Box::new(CountAccumulator(0))));
        registry.register_aggregate("sum", Box::new(|| Box::new(SumAccumulator::new(false))));
        registry.register_aggregate("total", Box::new(|| Box::new(SumAccumulator::new(true))));
        registry.register_aggregate("avg", Box::new(AvgAccumulator::boxed));
        registry.register_aggregate("min", Box::new(|| Box::new(ExtremeAccumulator::min())));
        registry.register_aggregate("max", Box::new(|| Box::new(ExtremeAccumulator::max())));
        registry
    }

    pub fn register_scalar(&mut self, name: &str, function: ScalarFn) {
        self.scalars.insert(name.to_ascii_lowercase(), function);
    }

    pub fn register_aggregate(&mut self, name: &str, factory: AccumulatorFactory) {
        self.aggregates.insert(name.to_ascii_lowercase(), factory);
    }

    /// Invoke a scalar function. A panic inside the function is caught and
    /// reported as a function failure instead of unwinding into the
    /// statement loop.
    pub fn call_scalar(&self, name: &str, args: &[Value]) -> Result<Value> {
        let function =
            self.scalars
                .get(&name.to_ascii_lowercase())
                .ok_or(DatabaseError::FunctionFailure {
                    name: name.to_string(),
                    reason: "no such scalar function".to_string(),
                })?;
        match catch_unwind(AssertUnwindSafe(|| function(args))) {
            Ok(result) => result,
            Err(_) => Err(DatabaseError::FunctionFailure {
                name: name.to_string(),
                reason: "function panicked".to_string(),
            }),
        }
    }

    pub fn new_accumulator(&self, name: &str) -> Result<GuardedAccumulator> {
        let factory =
            self.aggregates
                .get(&name.to_ascii_lowercase())
                .ok_or(DatabaseError::FunctionFailure {
                    name: name.to_string(),
                    reason: "no such aggregate function".to_string(),
                })?;
        Ok(GuardedAccumulator {
            name: name.to_string(),
            inner: factory(),
        })
    }
}

/// Wraps an accumulator with the same panic isolation scalar calls get.
pub struct GuardedAccumulator {
    name: String,
    inner: Box<dyn Accumulator>,
}

impl GuardedAccumulator {
    pub fn step(&mut self, args: &[Value]) -> Result<()> {
        let inner = &mut self.inner;
        match catch_unwind(AssertUnwindSafe(|| inner.step(args))) {
            Ok(result) => result,
            Err(_) => Err(DatabaseError::FunctionFailure {
                name: self.name.clone(),
                reason: "aggregate step panicked".to_string(),
            }),
        }
    }

    pub fn finish(&mut self) -> Result<Value> {
        let inner = &mut self.inner;
        match catch_unwind(AssertUnwindSafe(|| inner.finish())) {
            Ok(result) => result,
            Err(_) => Err(DatabaseError::FunctionFailure {
                name: self.name.clone(),
                reason: "aggregate finalizer panicked".to_string(),
            }),
        }
    }
}

fn single_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value> {
    match args {
        [value] => Ok(value),
        _ => Err(DatabaseError::FunctionFailure {
            name: name.to_string(),
            reason: format!("expected 1 argument, got {}", args.len()),
        }),
    }
}

fn scalar_abs(args: &[Value]) -> Result<Value> {
    match single_arg("abs", args)? {
        Value::Null => Ok(Value::Null),
        Value::Integer(n) => {
            n.checked_abs()
                .map(Value::Integer)
                .ok_or(DatabaseError::FunctionFailure {
                    name: "abs".to_string(),
                    reason: "integer overflow".to_string(),
                })
        }
        Value::Real(f) => Ok(Value::Real(f.abs())),
        other => other.coerce(DataType::Real).map(|v| match v {
            Value::Real(f) => Value::Real(f.abs()),
            v => v,
        }),
    }
}

fn scalar_length(args: &[Value]) -> Result<Value> {
    match single_arg("length", args)? {
        Value::Null => Ok(Value::Null),
        Value::Text(s) => Ok(Value::Integer(s.chars().count() as i64)),
        Value::Blob(b) => Ok(Value::Integer(b.len() as i64)),
        other => Ok(Value::Integer(other.render_text().chars().count() as i64)),
    }
}

fn scalar_upper(args: &[Value]) -> Result<Value> {
    match single_arg("upper", args)? {
        Value::Null => Ok(Value::Null),
        other => Ok(Value::Text(other.render_text().to_uppercase())),
    }
}

fn scalar_lower(args: &[Value]) -> Result<Value> {
    match single_arg("lower", args)? {
        Value::Null => Ok(Value::Null),
        other => Ok(Value::Text(other.render_text().to_lowercase())),
    }
}

fn scalar_coalesce(args: &[Value]) -> Result<Value> {
    Ok(args
        .iter()
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null))
}

fn scalar_typeof(args: &[Value]) -> Result<Value> {
    Ok(Value::Text(
        single_arg("typeof", args)?.data_type().name().to_string(),
    ))
}

struct CountAccumulator(i64);

impl Accumulator for CountAccumulator {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        // count(x) skips nulls, count() counts rows
        if args.first().map(|v| !v.is_null()).unwrap_or(true) {
            self.0 += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Value> {
        Ok(Value::Integer(self.0))
    }
}

/// sum() yields null over an all-null input and stays integral while it
/// can; total() always yields a real and starts from 0.0.
struct SumAccumulator {
    integer: i64,
    real: f64,
    use_real: bool,
    seen: bool,
    total_semantics: bool,
}

impl SumAccumulator {
    fn new(total_semantics: bool) -> Self {
        Self {
            integer: 0,
            real: 0.0,
            use_real: total_semantics,
            seen: false,
            total_semantics,
        }
    }
}

impl Accumulator for SumAccumulator {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        let value = args.first().unwrap_or(&Value::Null);
        if value.is_null() {
            return Ok(());
        }
        self.seen = true;
        if !self.use_real {
            if let Value::Integer(n) = value {
                match self.integer.checked_add(*n) {
                    Some(sum) => {
                        self.integer = sum;
                        return Ok(());
                    }
                    None => {
                        // Overflow falls back to real arithmetic.
                        self.use_real = true;
                        self.real = self.integer as f64;
                    }
                }
            } else {
                self.use_real = true;
                self.real = self.integer as f64;
            }
        }
        if let Value::Real(f) = value.coerce(DataType::Real)? {
            self.real += f;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Value> {
        if self.total_semantics {
            return Ok(Value::Real(self.real));
        }
        if !self.seen {
            return Ok(Value::Null);
        }
        if self.use_real {
            Ok(Value::Real(self.real))
        } else {
            Ok(Value::Integer(self.integer))
        }
    }
}

struct AvgAccumulator {
    sum: f64,
    count: i64,
}

impl AvgAccumulator {
    fn boxed() -> Box<dyn Accumulator> {
        Box::new(Self { sum: 0.0, count: 0 })
    }
}

impl Accumulator for AvgAccumulator {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        let value = args.first().unwrap_or(&Value::Null);
        if value.is_null() {
            return Ok(());
        }
        if let Value::Real(f) = value.coerce(DataType::Real)? {
            self.sum += f;
            self.count += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Value> {
        if self.count == 0 {
            Ok(Value::Null)
        } else {
            Ok(Value::Real(self.sum / self.count as f64))
        }
    }
}

struct ExtremeAccumulator {
    best: Option<Value>,
    want_max: bool,
}

impl ExtremeAccumulator {
    fn min() -> Self {
        Self {
            best: None,
            want_max: false,
        }
    }

    fn max() -> Self {
        Self {
            best: None,
            want_max: true,
        }
    }
}

impl Accumulator for ExtremeAccumulator {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        let value = args.first().unwrap_or(&Value::Null);
        if value.is_null() {
            return Ok(());
        }
        let better = match &self.best {
            None => true,
            Some(best) => {
                let ordering = value.key_cmp(best);
                if self.want_max {
                    ordering == std::cmp::Ordering::Greater
                } else {
                    ordering == std::cmp::Ordering::Less
                }
            }
        };
        if better {
            self.best = Some(value.clone());
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Value> {
        Ok(self.best.take().unwrap_or(Value::Null))
    }
}
