use serde::{Deserialize, Serialize};

/// Requires [`Passable::TIP`] to auto-implement conversion into [`Message`][crate::Message].
///
/// Usually implemented with `#[derive(Passable)]` from `procnet_macros`,
/// which uses the type name as the tip.
pub trait Passable: Serialize + for<'a> Deserialize<'a> {
    /// Represents tip of the message.
    const TIP: &'static str;
}
