pub mod change;
pub mod codec;
pub mod messages;

pub use change::{ChangeNotification, ObjectId, PropertyValue, LOCAL_CLIENT};
pub use codec::{Frame, WireEncoding};
pub use messages::{ActiveProject, RelayEvent, RelayRequest};
