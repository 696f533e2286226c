use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use quick_xml::escape::escape;
use roxmltree::Document;
use thiserror::Error;

use crate::save::DbId;
use crate::world::EntityKey;

const ROOT_TAG: &str = "Effect";
const TYPE_ATTRIBUTE: &str = "type";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("malformed effect definition XML at line {line}, column {column}: {message}")]
    Malformed {
        message: String,
        line: u32,
        column: u32,
    },
    #[error("effect definition root must be <Effect>, found <{found}>")]
    InvalidRoot { found: String },
    #[error("effect definition is missing its type attribute")]
    MissingType,
    #[error("duplicate field <{field}> in {specific_type} definition")]
    DuplicateField {
        specific_type: String,
        field: String,
    },
    #[error("missing field <{field}> in {specific_type} definition")]
    MissingField {
        specific_type: String,
        field: String,
    },
    #[error("invalid value '{value}' for field <{field}> in {specific_type} definition")]
    InvalidValue {
        specific_type: String,
        field: String,
        value: String,
    },
}

/// Parsed form of a saved effect: the type tag plus its flat field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectDefinition {
    specific_type: String,
    fields: BTreeMap<String, String>,
}

impl EffectDefinition {
    pub fn parse(raw: &str) -> Result<Self, DefinitionError> {
        let doc = Document::parse(raw).map_err(|error| DefinitionError::Malformed {
            message: error.to_string(),
            line: error.pos().row,
            column: error.pos().col,
        })?;

        let root = doc.root_element();
        if root.tag_name().name() != ROOT_TAG {
            return Err(DefinitionError::InvalidRoot {
                found: root.tag_name().name().to_string(),
            });
        }
        let specific_type = root
            .attribute(TYPE_ATTRIBUTE)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(DefinitionError::MissingType)?
            .to_string();

        let mut fields = BTreeMap::new();
        for field in root.children().filter(|node| node.is_element()) {
            let name = field.tag_name().name().to_string();
            let value = field.text().unwrap_or_default().to_string();
            if fields.insert(name.clone(), value).is_some() {
                return Err(DefinitionError::DuplicateField {
                    specific_type,
                    field: name,
                });
            }
        }

        Ok(Self {
            specific_type,
            fields,
        })
    }

    pub fn specific_type(&self) -> &str {
        &self.specific_type
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn optional(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn required(&self, field: &str) -> Result<&str, DefinitionError> {
        self.optional(field)
            .ok_or_else(|| DefinitionError::MissingField {
                specific_type: self.specific_type.clone(),
                field: field.to_string(),
            })
    }

    pub fn parse_field<T: FromStr>(&self, field: &str) -> Result<T, DefinitionError> {
        let raw = self.required(field)?;
        raw.trim()
            .parse::<T>()
            .map_err(|_| DefinitionError::InvalidValue {
                specific_type: self.specific_type.clone(),
                field: field.to_string(),
                value: raw.to_string(),
            })
    }

    pub fn db_id_field(&self, field: &str) -> Result<DbId, DefinitionError> {
        self.parse_field::<u64>(field).map(DbId)
    }
}

/// Builds the XML blob for one effect. Entity references are written as
/// durable ids resolved through `resolve`.
pub struct DefinitionWriter<'a> {
    specific_type: &'static str,
    fields: Vec<(&'static str, String)>,
    resolve: &'a dyn Fn(EntityKey) -> Option<DbId>,
}

impl<'a> DefinitionWriter<'a> {
    pub fn new(
        specific_type: &'static str,
        resolve: &'a dyn Fn(EntityKey) -> Option<DbId>,
    ) -> Self {
        Self {
            specific_type,
            fields: Vec::new(),
            resolve,
        }
    }

    pub fn field(&mut self, name: &'static str, value: impl Display) -> &mut Self {
        self.fields.push((name, value.to_string()));
        self
    }

    /// Writes a reference to another entity. Returns `false` when that entity
    /// has no durable identity yet.
    pub fn entity_ref(&mut self, name: &'static str, entity: EntityKey) -> bool {
        match (self.resolve)(entity) {
            Some(id) => {
                self.field(name, id.0);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self) -> String {
        let mut output = format!(
            "<{ROOT_TAG} {TYPE_ATTRIBUTE}=\"{}\">",
            escape(self.specific_type)
        );
        for (name, value) in &self.fields {
            output.push_str(&format!("<{name}>{}</{name}>", escape(value.as_str())));
        }
        output.push_str(&format!("</{ROOT_TAG}>"));
        output
    }
}
