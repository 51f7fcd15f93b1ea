pub mod nostr;

pub use nostr::{
    compute_event_id, Event, EventId, Filter, KeyMaterial, Keys, Kind, PublicKey, SecretKey,
    Timestamp, UnsignedEvent, NIP46_RPC_KIND,
};
