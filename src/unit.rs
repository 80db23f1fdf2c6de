use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::control::Controls;
use crate::error::{BoxError, CodecError};
use crate::value::Value;

/// Input values replacing the current ones for a single call.
pub type Overrides = BTreeMap<String, Value>;

/// What a box call produces: the values of every declared output plus any
/// extra metadata the box wants to report.
///
/// Persisted as `{id: {"outputs": {...}, ...extra}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub id: String,
    pub outputs: BTreeMap<String, Value>,
    pub extra: BTreeMap<String, Value>,
}

const OUTPUTS: &str = "outputs";

impl Report {
    pub fn new(id: impl Into<String>, outputs: BTreeMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            outputs,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    pub fn to_value(&self) -> Value {
        let mut body = self.extra.clone();
        body.insert(OUTPUTS.into(), Value::Map(self.outputs.clone()));
        Value::map([(self.id.clone(), Value::Map(body))])
    }

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let Value::Map(root) = value else {
            return Err(CodecError::Layout("expected a record keyed by box id".into()));
        };

        let mut entries = root.into_iter();
        let (id, body) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => return Err(CodecError::Layout("expected exactly one box id".into())),
        };

        let Value::Map(mut body) = body else {
            return Err(CodecError::Layout(format!("'{id}' is not a record")));
        };

        let outputs = match body.remove(OUTPUTS) {
            Some(Value::Map(outputs)) => outputs,
            _ => return Err(CodecError::Layout(format!("'{id}' has no outputs record"))),
        };

        Ok(Self {
            id,
            outputs,
            extra: body,
        })
    }
}

/// The capability set shared by boxes and the cache proxies wrapping them.
pub trait Unit {
    /// Dotted identity, also used to lay out cache directories.
    fn id(&self) -> &str;

    fn inputs(&self) -> &Controls;

    fn inputs_mut(&mut self) -> &mut Controls;

    fn outputs(&self) -> &Controls;

    fn outputs_mut(&mut self) -> &mut Controls;

    /// Runs the body with the current inputs and updates the outputs.
    fn execute(&mut self) -> anyhow::Result<Report>;

    /// Applies `overrides` to the inputs, then runs the box.
    fn call(&mut self, overrides: Overrides) -> Result<Report, BoxError> {
        apply_overrides(self, overrides)?;
        self.execute().map_err(|source| BoxError::Execution {
            id: self.id().to_string(),
            source,
        })
    }
}

/// Sets every override on the box inputs, or none of them if one names an
/// unknown input.
pub(crate) fn apply_overrides<U>(unit: &mut U, overrides: Overrides) -> Result<(), BoxError>
where
    U: Unit + ?Sized,
{
    if let Some(name) = overrides.keys().find(|name| !unit.inputs().contains(name)) {
        return Err(BoxError::UnknownInput {
            id: unit.id().to_string(),
            name: name.clone(),
        });
    }

    let inputs = unit.inputs_mut();
    for (name, value) in overrides {
        inputs.set(&name, value);
    }

    Ok(())
}

/// Renders a call as `id(a=1, b="x")`.
pub fn signature(id: &str, inputs: &BTreeMap<String, Value>) -> String {
    let args: Vec<String> = inputs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();

    format!("{}({})", id, args.join(", "))
}

type BoxFn = dyn Fn(&Controls) -> anyhow::Result<BTreeMap<String, Value>> + Send + Sync;

/// A box whose body is a plain closure from inputs to output values.
///
/// Cloning gives a box with its own copy of the slots bound to the same
/// body, so clones can be parametrized independently.
pub struct FnBox {
    id: String,
    inputs: Controls,
    outputs: Controls,
    func: Arc<BoxFn>,
}

impl FnBox {
    pub fn new<F>(id: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Controls) -> anyhow::Result<BTreeMap<String, Value>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            inputs: Controls::new(),
            outputs: Controls::new(),
            func: Arc::new(func),
        }
    }

    pub fn input(mut self, name: impl Into<String>, control: crate::Control) -> Self {
        self.inputs.insert(name, control);
        self
    }

    pub fn output(mut self, name: impl Into<String>, control: crate::Control) -> Self {
        self.outputs.insert(name, control);
        self
    }
}

impl Clone for FnBox {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl Debug for FnBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnBox({})", self.id)
    }
}

impl Unit for FnBox {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> &Controls {
        &self.inputs
    }

    fn inputs_mut(&mut self) -> &mut Controls {
        &mut self.inputs
    }

    fn outputs(&self) -> &Controls {
        &self.outputs
    }

    fn outputs_mut(&mut self) -> &mut Controls {
        &mut self.outputs
    }

    fn execute(&mut self) -> anyhow::Result<Report> {
        let produced = (self.func)(&self.inputs)?;

        for (name, value) in produced {
            if !self.outputs.set(&name, value) {
                anyhow::bail!("Box '{}' returned undeclared output '{}'", self.id, name);
            }
        }

        Ok(Report::new(&self.id, self.outputs.values())
            .with_extra("inputs", Value::Map(self.inputs.values())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Control;

    fn clothing() -> FnBox {
        FnBox::new("demo.module.clothing", |inputs| {
            let value = inputs.value("inp").cloned().unwrap_or_default();
            Ok(BTreeMap::from([("outp".to_string(), value)]))
        })
        .input("inp", Control::scalar())
        .output("outp", Control::scalar())
    }

    #[test]
    fn test_call_with_overrides() {
        let mut unit = clothing();

        let report = unit.call(Overrides::new()).unwrap();
        assert_eq!(report.output("outp"), Some(&Value::Null));

        let report = unit
            .call(Overrides::from([("inp".to_string(), Value::from("pantalon"))]))
            .unwrap();
        assert_eq!(report.output("outp"), Some(&Value::from("pantalon")));
        assert_eq!(unit.outputs().value("outp"), Some(&Value::from("pantalon")));
    }

    #[test]
    fn test_unknown_override_rejected() {
        let mut unit = clothing();
        let err = unit
            .call(Overrides::from([("nope".to_string(), Value::Int(1))]))
            .unwrap_err();
        assert!(matches!(err, BoxError::UnknownInput { .. }));
    }

    #[test]
    fn test_execution_error_kept() {
        let mut unit = FnBox::new("demo.fail", |_| anyhow::bail!("boom"));
        let err = unit.call(Overrides::new()).unwrap_err();
        assert_eq!(err.execution().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_clone_is_independent() {
        let mut a = clothing();
        let mut b = a.clone();
        a.inputs_mut().set("inp", "slip");
        b.inputs_mut().set("inp", "veste");

        assert_eq!(a.execute().unwrap().output("outp"), Some(&Value::from("slip")));
        assert_eq!(b.execute().unwrap().output("outp"), Some(&Value::from("veste")));
    }

    #[test]
    fn test_report_layout() {
        let report = clothing().execute().unwrap();
        let value = report.to_value();
        let body = value.as_map().unwrap()["demo.module.clothing"].as_map().unwrap();
        assert!(body.contains_key("outputs"));
        assert!(body.contains_key("inputs"));
        assert_eq!(Report::from_value(value).unwrap(), report);
    }

    #[test]
    fn test_signature() {
        let inputs = BTreeMap::from([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::from("x")),
        ]);
        assert_eq!(signature("box.id", &inputs), r#"box.id(a=1, b="x")"#);
    }
}
