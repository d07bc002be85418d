//! Domain models stored through the document helpers.
//!
//! Each record type knows its identity and how that identity maps onto a
//! storage key; nothing here touches a backend.

pub mod data;
pub mod record;
pub mod session;
pub mod user;

pub use data::ArbitraryData;
pub use record::{Record, RecordKind};
pub use session::SessionRecord;
pub use user::{AuthProvider, User, UserAuthMethod};
