use super::types::Definition;
use crate::error::Result;

/// Parse a definition document (YAML, or JSON as a YAML subset) into a Definition
pub fn parse_definition_str(content: &str) -> Result<Definition> {
    let definition: Definition = serde_yaml::from_str(content)?;
    Ok(definition)
}

/// Build a Definition from an already-parsed JSON tree
pub fn parse_definition_value(value: serde_json::Value) -> Result<Definition> {
    let definition: Definition = serde_json::from_value(value)?;
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FormatterSpec, ModelNames, PluginRef, VirtualSpec};

    #[test]
    fn test_parse_full_definition() {
        let def = parse_definition_str(
            r#"
name: Foo
db: test
models: [Foo, FooArchive]
itemType: foo
nameProperty: firstName
schema:
  firstName: String
  tags: [String]
  password: { type: String, bcrypt: true }
virtual:
  fullName:
    formatter:
      join: [firstName, lastName]
  label: "{firstName}!"
plugins:
  - timestamps
  - audit: { level: 2 }
indexes:
  - fields: { email: 1 }
    options: { unique: true }
views:
  list: all
"#,
        )
        .unwrap();

        assert_eq!(def.name.as_deref(), Some("Foo"));
        assert_eq!(def.db.as_deref(), Some("test"));
        assert_eq!(
            def.models,
            Some(ModelNames::Many(vec!["Foo".into(), "FooArchive".into()]))
        );
        assert_eq!(def.item_type.as_deref(), Some("foo"));
        assert_eq!(def.name_property.as_deref(), Some("firstName"));
        assert_eq!(def.schema.as_ref().unwrap().len(), 3);
        assert!(matches!(
            def.virtuals["fullName"],
            VirtualSpec::Formatter { formatter: Some(FormatterSpec::Call(_)) }
        ));
        assert!(matches!(def.virtuals["label"], VirtualSpec::Template(_)));
        assert!(matches!(def.plugins[0], PluginRef::Name(ref n) if n == "timestamps"));
        assert!(matches!(def.plugins[1], PluginRef::WithOptions(_)));
        assert_eq!(def.indexes.len(), 1);
        assert!(def.extra.contains_key("views"));
    }

    #[test]
    fn test_single_model_alias() {
        let def = parse_definition_str("name: Bar\nmodel: BarModel\nschema:\n  a: Number\n").unwrap();
        assert_eq!(def.models, Some(ModelNames::One("BarModel".into())));
    }

    #[test]
    fn test_json_is_accepted() {
        let def = parse_definition_str(r#"{"name": "Baz", "schema": {"n": "Number"}}"#).unwrap();
        assert_eq!(def.name.as_deref(), Some("Baz"));
    }
}
