//! UI-facing surface: status projection and the avatar view coordinator

mod avatar;
mod status;

pub use avatar::AvatarView;
pub use status::{AvatarStatus, StatusView};
