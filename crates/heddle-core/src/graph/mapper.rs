//! Input / output mappers.
//!
//! A mapper is a pure function from already-known values (run input, upstream
//! results) to a new value. Handlers see exactly what the mapper produces, so any
//! shape normalization belongs here.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::TaskName;
use crate::error::TaskError;

/// What a mapper can see.
#[derive(Debug, Clone)]
pub struct MapperContext<'a> {
    input: &'a Value,
    upstream: Vec<(&'a TaskName, &'a Value)>,
}

impl<'a> MapperContext<'a> {
    pub fn new(input: &'a Value, upstream: Vec<(&'a TaskName, &'a Value)>) -> Self {
        Self { input, upstream }
    }

    /// The run input.
    pub fn input(&self) -> &'a Value {
        self.input
    }

    /// Upstream results in dependency order.
    pub fn upstream(&self) -> &[(&'a TaskName, &'a Value)] {
        &self.upstream
    }

    pub fn result(&self, task: &str) -> Option<&'a Value> {
        self.upstream
            .iter()
            .find(|(name, _)| name.as_str() == task)
            .map(|(_, value)| *value)
    }

    /// Like [`result`](Self::result), but a missing result is a `Permanent` error.
    pub fn require(&self, task: &str) -> Result<&'a Value, TaskError> {
        self.result(task)
            .ok_or_else(|| TaskError::permanent(format!("no result from `{task}`")))
    }

    /// `require` + string view. For mappers that build text from upstream results.
    pub fn require_str(&self, task: &str) -> Result<&'a str, TaskError> {
        self.require(task)?
            .as_str()
            .ok_or_else(|| TaskError::permanent(format!("result of `{task}` is not a string")))
    }
}

type MapFn = dyn Fn(&MapperContext<'_>) -> Result<Value, TaskError> + Send + Sync;

/// Computes a task's input.
#[derive(Clone)]
pub struct InputMapper {
    f: Arc<MapFn>,
}

impl InputMapper {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&MapperContext<'_>) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// No dependencies → the run input. One → its result. Several → ordered array.
    pub fn passthrough() -> Self {
        Self::from_fn(|ctx| {
            Ok(match ctx.upstream() {
                [] => ctx.input().clone(),
                [(_, only)] => (*only).clone(),
                many => Value::Array(many.iter().map(|(_, v)| (*v).clone()).collect()),
            })
        })
    }

    /// Always the run input, whatever the dependencies.
    pub fn run_input() -> Self {
        Self::from_fn(|ctx| Ok(ctx.input().clone()))
    }

    /// Ordered array of dependency results, even for a single dependency.
    pub fn collect() -> Self {
        Self::from_fn(|ctx| {
            Ok(Value::Array(
                ctx.upstream().iter().map(|(_, v)| (*v).clone()).collect(),
            ))
        })
    }

    pub fn map(&self, ctx: &MapperContext<'_>) -> Result<Value, TaskError> {
        (self.f)(ctx)
    }
}

impl Default for InputMapper {
    fn default() -> Self {
        Self::passthrough()
    }
}

impl fmt::Debug for InputMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InputMapper(..)")
    }
}

/// Computes the run result once every task succeeded.
///
/// Sees every task's result, in declaration order.
#[derive(Clone)]
pub struct OutputMapper {
    f: Arc<MapFn>,
}

impl OutputMapper {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&MapperContext<'_>) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// The result of one named task.
    pub fn task(task: impl Into<TaskName>) -> Self {
        let task = task.into();
        Self::from_fn(move |ctx| ctx.require(task.as_str()).cloned())
    }

    /// `{ "task name": result, ... }` for every task.
    pub fn all() -> Self {
        Self::from_fn(|ctx| {
            Ok(Value::Object(
                ctx.upstream()
                    .iter()
                    .map(|(name, value)| (name.to_string(), (*value).clone()))
                    .collect(),
            ))
        })
    }

    pub fn map(&self, ctx: &MapperContext<'_>) -> Result<Value, TaskError> {
        (self.f)(ctx)
    }
}

impl fmt::Debug for OutputMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputMapper(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn passthrough_depends_on_arity() {
        let input = json!("World-42");
        let (a, b) = (TaskName::new("a"), TaskName::new("b"));
        let (va, vb) = (json!(1), json!(2));
        let mapper = InputMapper::passthrough();

        assert_eq!(mapper.map(&MapperContext::new(&input, vec![])).unwrap(), input);
        assert_eq!(mapper.map(&MapperContext::new(&input, vec![(&a, &va)])).unwrap(), json!(1));
        assert_eq!(
            mapper
                .map(&MapperContext::new(&input, vec![(&a, &va), (&b, &vb)]))
                .unwrap(),
            json!([1, 2])
        );
    }

    #[test]
    fn collect_always_yields_an_array() {
        let input = json!(null);
        let a = TaskName::new("a");
        let va = json!("x");

        let out = InputMapper::collect()
            .map(&MapperContext::new(&input, vec![(&a, &va)]))
            .unwrap();
        assert_eq!(out, json!(["x"]));
    }

    #[test]
    fn require_reports_missing_result_as_permanent() {
        let input = json!(null);
        let ctx = MapperContext::new(&input, vec![]);

        let err = ctx.require("greet").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn output_task_and_all() {
        let input = json!(null);
        let (greet, react) = (TaskName::new("greet"), TaskName::new("react"));
        let (g, r) = (json!("Hello, World-42!"), json!("hi"));
        let ctx = MapperContext::new(&input, vec![(&greet, &g), (&react, &r)]);

        assert_eq!(OutputMapper::task("react").map(&ctx).unwrap(), json!("hi"));
        assert_eq!(
            OutputMapper::all().map(&ctx).unwrap(),
            json!({"greet": "Hello, World-42!", "react": "hi"})
        );
    }

    #[test]
    fn custom_mapper_can_fail() {
        let input = json!(5);
        let ctx = MapperContext::new(&input, vec![]);
        let mapper = InputMapper::from_fn(|ctx| {
            ctx.input()
                .as_str()
                .map(|s| json!(s.len()))
                .ok_or_else(|| TaskError::permanent("expected a string"))
        });

        assert_eq!(mapper.map(&ctx), Err(TaskError::permanent("expected a string")));
    }
}
