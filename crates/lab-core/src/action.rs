//! `Action` - a device-backed method with no attribute semantics.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Named async operation taking and returning JSON.
///
/// Arguments are a JSON object (or `null` for actions without arguments);
/// handlers decode them with [`Action::args`].
#[derive(Clone)]
pub struct Action {
    name: String,
    description: Option<String>,
    handler: Handler,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            handler: Arc::new(handler),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub async fn call(&self, args: Value) -> Result<Value> {
        tracing::debug!(action = %self.name, args = %args, "calling action");
        (self.handler)(args).await
    }

    /// Decode action arguments; `null` decodes as an empty object so
    /// argument structs made of `#[serde(default)]` fields accept it.
    pub fn args<T: DeserializeOwned>(args: Value) -> Result<T> {
        let args = match args {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Ok(serde_json::from_value(args)?)
    }

    /// Encode an action result.
    pub fn reply<T: Serialize>(value: T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct HomeArgs {
        #[serde(default = "default_axis")]
        axis: u8,
    }

    fn default_axis() -> u8 {
        1
    }

    #[tokio::test]
    async fn args_decode_with_defaults() {
        let action = Action::new("home", |args| {
            Box::pin(async move {
                let args: HomeArgs = Action::args(args)?;
                Action::reply(format!("{}OR", args.axis))
            })
        });

        assert_eq!(action.call(Value::Null).await.unwrap(), "1OR");
        assert_eq!(
            action.call(serde_json::json!({"axis": 3})).await.unwrap(),
            "3OR"
        );
        assert!(action.call(serde_json::json!({"axis": "x"})).await.is_err());
    }
}
