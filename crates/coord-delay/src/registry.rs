use std::{collections::HashMap, sync::Arc};

use tracing::trace;

use crate::{
    error::DelayError,
    task::{DelayedTask, TaskPayload},
};

type Decoder = Arc<dyn Fn(&str) -> Result<Box<dyn DelayedTask>, serde_json::Error> + Send + Sync>;

/// Closed set of task types this process knows how to execute, keyed by
/// [`TaskPayload::TYPE_NAME`].
#[derive(Clone, Default)]
pub struct TaskRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type that executes itself.
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: TaskPayload + DelayedTask,
    {
        self.register_with(|payload: T| payload)
    }

    /// Register a payload type whose executor is built from the payload plus
    /// whatever `build` captures (store handles, runner, config...).
    ///
    /// The capture happens in the executing process at claim time.
    pub fn register_with<T, D, F>(&mut self, build: F) -> &mut Self
    where
        T: TaskPayload,
        D: DelayedTask,
        F: Fn(T) -> D + Send + Sync + 'static,
    {
        let decoder: Decoder = Arc::new(move |instance: &str| {
            let payload: T = serde_json::from_str(instance)?;
            Ok(Box::new(build(payload)) as Box<dyn DelayedTask>)
        });
        if self.decoders.insert(T::TYPE_NAME, decoder).is_some() {
            trace!(type_name = T::TYPE_NAME, "task type registered twice; keeping the latest");
        }
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Rebuild the task stored as `instance` under `type_name`.
    pub fn decode(&self, type_name: &str, instance: &str) -> Result<Box<dyn DelayedTask>, DelayError> {
        let decoder = self
            .decoders
            .get(type_name)
            .ok_or_else(|| DelayError::PayloadCorrupt {
                type_name: type_name.to_string(),
                reason: "unknown task type".into(),
            })?;

        decoder(instance).map_err(|e| DelayError::PayloadCorrupt {
            type_name: type_name.to_string(),
            reason: e.to_string(),
        })
    }
}
