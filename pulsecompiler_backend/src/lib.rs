//! # pulsecompiler_backend
//!
//! Chip-centred pulse sequencing. A [`Layout`](layout::Layout) ties together
//! [instrument interfaces](interface), the [connections](connection) routed between their
//! [channels](channel) and the [pulse lines](pulse_line) sent over each connection. Lines are
//! scheduled into absolute time, validated against the [conditions](channel::ChannelCondition) of
//! every channel they cross and compiled into sample-grid [tracks](track) before any instrument
//! sees them.
//!
//! ```
//! use pulsecompiler_backend::*;
//!
//! let mut layout = Layout::with_interfaces(vec![
//!     InstrumentInterface::sp1060("sp1060", 24).unwrap(),
//!     InstrumentInterface::chip("chip1", &[ChannelSpec::dc("Gate1", 1, -0.5, 0.5).input()]).unwrap(),
//! ]).unwrap();
//! let conn = layout.add_connection("sp1060.Ch1", "chip1.Gate1", ConnectionInfo::default()).unwrap();
//! let mut elements = indexmap::IndexMap::new();
//! elements.insert("step".to_string(), PulseElement::new(vec![Pulse::dc_fixed("p", 0.3, 0., 0.01).unwrap()], 0., 3));
//! layout.config_pulse_line("plunger", conn, 0., None, Some(elements), None).unwrap();
//! assert!(layout.validate().is_ok());
//! let tracks = layout.compile(None).unwrap();
//! assert_eq!(tracks["plunger"].total_samps(), 30);
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod instruction;
pub mod interface;
pub mod layout;
pub mod pulse;
pub mod pulse_line;
#[cfg(feature = "python")]
pub mod python;
pub mod track;
pub mod utils;
pub mod validation;

pub use channel::*;
pub use config::*;
pub use connection::*;
pub use error::{Error, Result};
pub use instruction::*;
pub use interface::*;
pub use layout::*;
pub use pulse::*;
pub use pulse_line::*;
pub use track::*;
pub use validation::*;
