pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod util;
pub mod value;

pub use self::core::{FirestoreClient, ListenOptions, ListenerRegistration, Query, ViewSnapshot};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::FirestoreSettings;
