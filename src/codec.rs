use crate::model::Object;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode object: {0}")]
    Decode(String),

    #[error("failed to encode object: {0}")]
    Encode(#[source] serde_yaml::Error),
}

/// YAML encoding of objects, as shown to and edited by the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl YamlCodec {
    pub fn encode(&self, object: &Object) -> Result<String, CodecError> {
        let mut object = object.clone();
        object.metadata.managed_fields = None;
        serde_yaml::to_string(&object).map_err(CodecError::Encode)
    }

    pub fn decode(&self, text: &str) -> Result<Object, CodecError> {
        let object: Object =
            serde_yaml::from_str(text).map_err(|error| CodecError::Decode(error.to_string()))?;

        let Some(types) = object.types.as_ref() else {
            return Err(CodecError::Decode(
                "apiVersion and kind are required".to_string(),
            ));
        };
        if types.api_version.trim().is_empty() || types.kind.trim().is_empty() {
            return Err(CodecError::Decode(
                "apiVersion and kind must not be empty".to_string(),
            ));
        }
        if object
            .metadata
            .name
            .as_deref()
            .is_none_or(|name| name.trim().is_empty())
        {
            return Err(CodecError::Decode("metadata.name is required".to_string()));
        }

        Ok(object)
    }
}
