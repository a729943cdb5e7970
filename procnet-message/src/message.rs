use serde::{Deserialize, Serialize};

use crate::Passable;

/// Represents message, which is used by processes to communicate
/// with each other through the router.
///
/// The payload is kept in serialized form, so cloning a message
/// always yields an independent copy of the data.
#[derive(Serialize, Deserialize, Clone, Eq, Hash, PartialEq, PartialOrd, Ord, Debug)]
pub struct Message {
    tip: String,
    data: Vec<u8>,
}

impl Message {
    /// Create a new message with specified tip and data, which will be serialized and passed
    /// inside of the message.
    pub fn new<T>(tip: &str, data: &T) -> Result<Self, String>
    where
        T: Serialize,
    {
        serde_json::to_vec(data)
            .map_err(|err| "Can not create message: ".to_owned() + err.to_string().as_str())
            .map(|data| Self {
                tip: tip.to_string(),
                data,
            })
    }

    /// Same as [`Message::new`], but takes data by value.
    pub fn borrow_new<T>(tip: &str, data: T) -> Result<Self, String>
    where
        T: Serialize,
    {
        Self::new(tip, &data)
    }

    /// Create a new message with specified tip and raw data.
    pub fn new_raw(tip: &str, data: &[u8]) -> Result<Self, String> {
        Ok(Self {
            tip: tip.to_string(),
            data: data.to_vec(),
        })
    }

    /// Get message's tip.
    pub fn get_tip(&self) -> &String {
        &self.tip
    }

    /// Get message's raw data.
    pub fn get_raw_data(&self) -> &[u8] {
        &self.data
    }

    /// Returns deserialized message's data of template type,
    /// which must implement [`Deserialize`] trait.
    pub fn get_data<'a, T>(&'a self) -> Result<T, String>
    where
        T: Deserialize<'a>,
    {
        serde_json::from_slice::<'a, T>(self.data.as_slice()).map_err(|err| err.to_string())
    }

    /// Returns message data as untyped json value.
    pub fn get_value(&self) -> Result<serde_json::Value, String> {
        self.get_data::<serde_json::Value>()
    }

    /// Size of the serialized payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Checks if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////////////

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::new("info", &value).unwrap()
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::new("info", &value).unwrap()
    }
}

////////////////////////////////////////////////////////////////////////////////

impl<T: Passable> From<&T> for Message {
    fn from(value: &T) -> Self {
        Self::new(T::TIP, value).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::Message;
    use crate::Passable;

    #[test]
    fn message_basic() {
        let message = Message::new("message_type", &"hello".to_string()).unwrap();
        assert_eq!(message.get_tip(), "message_type");
        assert_eq!(message.get_data::<String>().unwrap(), "hello");

        let message = Message::borrow_new("type_1", format!("format_str_{}", 1)).unwrap();
        assert_eq!(message.get_data::<String>().unwrap(), "format_str_1");
    }

    #[test]
    fn clone_does_not_share_payload() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Counter {
            value: u32,
        }

        impl Passable for Counter {
            const TIP: &'static str = "Counter";
        }

        let mut counter = Counter { value: 1 };
        let message: Message = (&counter).into();
        counter.value = 2;
        let copy = message.clone();

        assert_eq!(message.get_tip(), "Counter");
        assert_eq!(copy.get_data::<Counter>().unwrap(), Counter { value: 1 });
    }
}
