//! Configuration schema and loading

mod loader;
mod schema;

pub use loader::{load, ENV_API_KEY, ENV_AUDIO_DEVICE, ENV_FACE_ID, ENV_SESSION_URL};
pub use schema::*;
