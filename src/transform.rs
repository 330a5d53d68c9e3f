//! Source record to write directive conversion

use crate::config::{Destination, Routing};
use crate::doc::{fields, OpType, SourceRecord, WriteDirective};
use crate::error::{ScriptError, TransformError};
use crate::script::{ops, BoundScript, ScriptContext};
use serde_json::{Map, Value};
use tracing::trace;

/// Result of transforming one record
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// Submit this directive
    Write(WriteDirective),
    /// The script asked to skip the record
    Drop,
}

/// Preserved metadata read off a record
#[derive(Debug, Default)]
struct Metadata {
    routing: Option<String>,
    parent: Option<String>,
    timestamp: Option<String>,
    ttl: Option<i64>,
}

/// Converts scroll hits into bulk directives for one destination
#[derive(Debug, Clone)]
pub struct RecordTransformer {
    destination: Destination,
    script: Option<BoundScript>,
}

impl RecordTransformer {
    pub fn new(destination: Destination, script: Option<BoundScript>) -> Self {
        Self {
            destination,
            script,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Transform one record
    pub fn transform(&self, record: &SourceRecord) -> Result<Transformed, TransformError> {
        let meta = self.read_metadata(record)?;

        let mut directive = WriteDirective {
            op: OpType::Index,
            index: self.destination.index.clone(),
            doc_type: self
                .destination
                .doc_type
                .clone()
                .unwrap_or_else(|| record.doc_type.clone()),
            id: record.id.clone(),
            source: None,
            routing: meta.routing,
            parent: meta.parent,
            timestamp: meta.timestamp,
            ttl: meta.ttl,
            version: None,
            version_type: self.destination.version_type,
        };

        if self.destination.version_type.carries_source_version() {
            directive.version = record.version;
        }

        match &self.script {
            None => {
                directive.source = Some(record.source.clone());
                Ok(Transformed::Write(directive))
            }
            Some(script) => self.apply_script(script, record, directive),
        }
    }

    /// Transform a page of records, returning the directives and the number
    /// of records the script dropped
    pub fn transform_batch(
        &self,
        records: &[SourceRecord],
    ) -> Result<(Vec<WriteDirective>, usize), TransformError> {
        let mut directives = Vec::with_capacity(records.len());
        let mut dropped = 0;

        for record in records {
            match self.transform(record)? {
                Transformed::Write(directive) => directives.push(directive),
                Transformed::Drop => dropped += 1,
            }
        }

        Ok((directives, dropped))
    }

    fn apply_script(
        &self,
        script: &BoundScript,
        record: &SourceRecord,
        mut directive: WriteDirective,
    ) -> Result<Transformed, TransformError> {
        let source: Map<String, Value> =
            serde_json::from_str(&record.source).map_err(|e| TransformError::InvalidSource {
                id: record.id.clone(),
                reason: e.to_string(),
            })?;

        let mut ctx = ScriptContext {
            source,
            index: record.index.clone(),
            doc_type: record.doc_type.clone(),
            id: record.id.clone(),
            version: record.version,
            routing: directive.routing.clone(),
            parent: directive.parent.clone(),
            op: None,
        };

        let script_error = |source: ScriptError| TransformError::Script {
            id: record.id.clone(),
            source,
        };

        script.run(&mut ctx).map_err(script_error)?;

        if ctx.id != record.id {
            directive.id = ctx.id;
        }
        if ctx.doc_type != record.doc_type {
            directive.doc_type = ctx.doc_type;
        }
        directive.routing = ctx.routing;
        directive.parent = ctx.parent;

        match ctx.op.as_deref() {
            None | Some(ops::INDEX) => {
                let body = serde_json::to_string(&ctx.source).map_err(|e| TransformError::InvalidSource {
                    id: record.id.clone(),
                    reason: e.to_string(),
                })?;
                directive.source = Some(body);
                Ok(Transformed::Write(directive))
            }
            Some(ops::NOOP) => {
                trace!(id = %record.id, script = script.name(), "Script dropped document");
                Ok(Transformed::Drop)
            }
            Some(ops::DELETE) => {
                directive.op = OpType::Delete;
                directive.source = None;
                Ok(Transformed::Write(directive))
            }
            Some(other) => Err(script_error(ScriptError::UnsupportedOp {
                op: other.to_string(),
            })),
        }
    }

    fn read_metadata(&self, record: &SourceRecord) -> Result<Metadata, TransformError> {
        let routing = match &self.destination.routing {
            Routing::Keep => string_field(record, fields::ROUTING)?,
            Routing::Discard => None,
            Routing::Fixed(value) => Some(value.clone()),
        };

        let timestamp = match record.field(fields::TIMESTAMP) {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            Some(other) => return Err(invalid(record, fields::TIMESTAMP, other)),
        };

        let ttl = match record.field(fields::TTL) {
            None => None,
            Some(value) => Some(value.as_i64().ok_or_else(|| invalid(record, fields::TTL, value))?),
        };

        Ok(Metadata {
            routing,
            parent: string_field(record, fields::PARENT)?,
            timestamp,
            ttl,
        })
    }
}

fn string_field(record: &SourceRecord, name: &str) -> Result<Option<String>, TransformError> {
    match record.field(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(invalid(record, name, other)),
    }
}

fn invalid(record: &SourceRecord, field: &str, value: &Value) -> TransformError {
    TransformError::InvalidMetadata {
        id: record.id.clone(),
        field: field.to_string(),
        reason: format!("unexpected value {}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptSpec;
    use crate::doc::VersionType;
    use crate::script::ScriptRegistry;
    use serde_json::json;

    fn destination() -> Destination {
        Destination {
            index: "dest".into(),
            ..Default::default()
        }
    }

    fn record() -> SourceRecord {
        SourceRecord::new("source", "test", "1", "{ \"foo\" : \"bar\" }").with_version(7)
    }

    fn scripted(spec: ScriptSpec) -> RecordTransformer {
        let script = ScriptRegistry::builtin().resolve(&spec).unwrap();
        RecordTransformer::new(destination(), Some(script))
    }

    fn write(t: Transformed) -> WriteDirective {
        match t {
            Transformed::Write(d) => d,
            Transformed::Drop => panic!("expected a write"),
        }
    }

    #[test]
    fn test_copies_source_verbatim() {
        let t = RecordTransformer::new(destination(), None);
        let d = write(t.transform(&record()).unwrap());
        assert_eq!(d.op, OpType::Index);
        assert_eq!(d.index, "dest");
        assert_eq!(d.doc_type, "test");
        assert_eq!(d.id, "1");
        assert_eq!(d.source.as_deref(), Some("{ \"foo\" : \"bar\" }"));
        assert_eq!(d.version, None);
    }

    #[test]
    fn test_destination_type_overrides_record_type() {
        let mut dest = destination();
        dest.doc_type = Some("other".into());
        let d = write(RecordTransformer::new(dest, None).transform(&record()).unwrap());
        assert_eq!(d.doc_type, "other");
    }

    #[test]
    fn test_metadata_coercions() {
        let rec = record()
            .with_field(fields::ROUTING, json!("r1"))
            .with_field(fields::PARENT, json!(42))
            .with_field(fields::TIMESTAMP, json!(1_400_000_000_000_i64))
            .with_field(fields::TTL, json!(86_400_000));

        let d = write(RecordTransformer::new(destination(), None).transform(&rec).unwrap());
        assert_eq!(d.routing.as_deref(), Some("r1"));
        assert_eq!(d.parent.as_deref(), Some("42"));
        assert_eq!(d.timestamp.as_deref(), Some("1400000000000"));
        assert_eq!(d.ttl, Some(86_400_000));
    }

    #[test]
    fn test_invalid_ttl_is_rejected() {
        let rec = record().with_field(fields::TTL, json!("1d"));
        let err = RecordTransformer::new(destination(), None).transform(&rec).unwrap_err();
        assert!(matches!(err, TransformError::InvalidMetadata { ref field, .. } if field == "_ttl"));
    }

    #[test]
    fn test_null_metadata_is_absent() {
        let rec = record().with_field(fields::TTL, Value::Null);
        let d = write(RecordTransformer::new(destination(), None).transform(&rec).unwrap());
        assert_eq!(d.ttl, None);
    }

    #[test]
    fn test_routing_policies() {
        let rec = record().with_field(fields::ROUTING, json!("r1"));

        let mut dest = destination();
        dest.routing = Routing::Discard;
        let d = write(RecordTransformer::new(dest.clone(), None).transform(&rec).unwrap());
        assert_eq!(d.routing, None);

        dest.routing = Routing::Fixed("fixed".into());
        let d = write(RecordTransformer::new(dest, None).transform(&rec).unwrap());
        assert_eq!(d.routing.as_deref(), Some("fixed"));
    }

    #[test]
    fn test_version_carried_for_external_types() {
        for (vt, expected) in [
            (VersionType::Internal, None),
            (VersionType::Reindex, None),
            (VersionType::External, Some(7)),
            (VersionType::ExternalGte, Some(7)),
            (VersionType::Force, Some(7)),
        ] {
            let mut dest = destination();
            dest.version_type = vt;
            let d = write(RecordTransformer::new(dest, None).transform(&record()).unwrap());
            assert_eq!(d.version, expected, "{}", vt);
            assert_eq!(d.version_type, vt);
        }
    }

    #[test]
    fn test_script_rewrites_source() {
        let t = scripted(ScriptSpec::new("set-field").param("field", json!("n")).param("value", json!(2)));
        let d = write(t.transform(&record()).unwrap());
        let body: Value = serde_json::from_str(d.source.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"foo": "bar", "n": 2}));
    }

    #[test]
    fn test_script_noop_drops() {
        let t = scripted(ScriptSpec::new("noop"));
        assert_eq!(t.transform(&record()).unwrap(), Transformed::Drop);

        let (directives, dropped) = t.transform_batch(&[record(), record()]).unwrap();
        assert!(directives.is_empty());
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_script_delete() {
        let t = scripted(ScriptSpec::new("delete"));
        let d = write(t.transform(&record()).unwrap());
        assert_eq!(d.op, OpType::Delete);
        assert_eq!(d.source, None);
        assert_eq!(d.id, "1");
    }

    #[test]
    fn test_unsupported_op_is_script_error() {
        let registry = ScriptRegistry::new().with(
            "bad-op",
            |ctx: &mut ScriptContext, _: &Map<String, Value>| -> Result<(), ScriptError> {
                ctx.op = Some("update".into());
                Ok(())
            },
        );
        let script = registry.resolve(&ScriptSpec::new("bad-op")).unwrap();
        let t = RecordTransformer::new(destination(), Some(script));

        let err = t.transform(&record()).unwrap_err();
        assert!(matches!(
            err,
            TransformError::Script {
                source: ScriptError::UnsupportedOp { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_script_changes_identity() {
        let registry = ScriptRegistry::new().with(
            "rename",
            |ctx: &mut ScriptContext, _: &Map<String, Value>| -> Result<(), ScriptError> {
                ctx.id = format!("{}-copy", ctx.id);
                ctx.doc_type = "renamed".into();
                ctx.routing = Some("r2".into());
                Ok(())
            },
        );
        let script = registry.resolve(&ScriptSpec::new("rename")).unwrap();
        let d = write(RecordTransformer::new(destination(), Some(script)).transform(&record()).unwrap());
        assert_eq!(d.id, "1-copy");
        assert_eq!(d.doc_type, "renamed");
        assert_eq!(d.routing.as_deref(), Some("r2"));
    }

    #[test]
    fn test_script_on_non_object_source() {
        let t = scripted(ScriptSpec::new("identity"));
        let rec = SourceRecord::new("source", "test", "1", "[1,2]");
        assert!(matches!(t.transform(&rec), Err(TransformError::InvalidSource { .. })));
    }
}
