//! Room access brokering: registered game-server rooms, time-boxed access
//! tokens and the registry that owns them.

pub mod registry;
pub mod room;

pub use registry::{RoomRegistry, RoomsConfig};
pub use room::{RegisteredRoom, RoomError, RoomId};
