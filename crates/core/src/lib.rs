#![forbid(unsafe_code)]
#![deny(warnings)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![doc = "Cairn çekirdek kütüphanesi; sertifika otoritesi katmanlarının paylaştığı\
zaman kaynağı yeteneğini ve URL güvenli rastgele token üretimini sağlar."]

pub mod clock;
pub mod rand;

pub use clock::{Clock, FixedClock, SystemClock};
pub use rand::url_safe_token;
