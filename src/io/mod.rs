//! IO modules - external system interfaces
//!
//! - `advert_listener` - TCP listener for newline-delimited advertisement records
//! - `mqtt_control` - MQTT subscriber for runtime commands and device config
//! - `event_channel` - Bounded channel carrying lifecycle events out of the registry

pub mod advert_listener;
pub mod event_channel;
pub mod mqtt_control;

// Re-export commonly used types
pub use advert_listener::{parse_advert_line, start_advert_listener, AdvertListenerConfig};
pub use event_channel::{create_event_channel, EventSender, LifecycleKind, PresenceEvent};
pub use mqtt_control::{apply_control, start_mqtt_control, ControlTopic, ControlTopics};
