// OTA (Over-The-Air) update engine
//
// Update flow:
// 1. begin: pick the inactive region, check the declared size
// 2. feed: parse the header, erase and write, hold back the signature zone
// 3. finish: verify the digest, write trailer and signature
// 4. commit: flip the active bank (or arm the bootloader copy)

pub mod image;
pub mod manager;
pub mod receiver;
pub mod session;
pub mod verifier;

pub use image::{verify_image, ImageBuilder, ImageFormat, ImageHeader};
pub use manager::{AbortHandle, OtaManager, SessionId, StatusSnapshot};
pub use receiver::{receive_into, receive_update, receive_with_yield, ReceiveOptions};
pub use session::{FinishReport, OtaSession, SessionState};
