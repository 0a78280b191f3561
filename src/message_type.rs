//! Typed message names.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::message::Envelope;

/// Names a command or event shape and validates payloads against it.
///
/// The schema is the Rust type `T`: a payload is valid when it deserializes
/// into `T`. Handlers registered through a `MessageType<T>` only ever see
/// values that passed that check.
///
/// # Examples
///
/// ```
/// use eventfold_runtime::MessageType;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Deposited {
///     account_id: String,
///     amount: u64,
/// }
///
/// let deposited = MessageType::<Deposited>::new("Deposited");
/// let envelope = deposited
///     .envelope(&Deposited { account_id: "a1".into(), amount: 10 })
///     .unwrap();
/// assert_eq!(envelope.message_type, "Deposited");
/// assert_eq!(envelope.data["amount"], 10);
/// ```
pub struct MessageType<T> {
    name: String,
    _schema: PhantomData<fn() -> T>,
}

impl<T> MessageType<T> {
    /// Create a message type called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _schema: PhantomData,
        }
    }

    /// The type tag written to the store.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Serialize + DeserializeOwned> MessageType<T> {
    /// Build a `{type, data}` envelope from `data`.
    ///
    /// The payload is re-validated through `T` so the envelope carries
    /// exactly what a reader of this type would accept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if `data` does not round-trip
    /// through `T`'s serde representation.
    pub fn envelope(&self, data: &T) -> Result<Envelope, Error> {
        let value = serde_json::to_value(data).map_err(|source| self.invalid(source))?;
        self.parse(&value)?;
        Ok(Envelope::new(self.name.clone(), value))
    }

    /// Validate an inbound payload and decode it into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if the payload does not match.
    pub fn parse(&self, data: &Value) -> Result<T, Error> {
        T::deserialize(data).map_err(|source| self.invalid(source))
    }

    fn invalid(&self, source: serde_json::Error) -> Error {
        Error::InvalidPayload {
            message_type: self.name.clone(),
            source,
        }
    }
}

impl<T> Clone for MessageType<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> fmt::Debug for MessageType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name)
            .field("schema", &std::any::type_name::<T>())
            .finish()
    }
}
