use lazy_static::lazy_static;
use prometheus::{Gauge, Registry, TextEncoder};

lazy_static! {
    pub static ref VIEWERS_CONNECTED: Gauge =
        Gauge::new("viewers_connected", "viewers currently in the Connected state").unwrap();
    pub static ref CLIENTS_REGISTERED: Gauge =
        Gauge::new("clients_registered", "clients currently registered with the broker").unwrap();
    pub static ref OBSERVED_FPS: Gauge =
        Gauge::new("observed_fps", "most recently detected transcoder frame rate").unwrap();
    pub static ref REGISTRY: Registry =
        Registry::new_custom(Some("media_relay".to_string()), None).unwrap();
    pub static ref ENCODER: TextEncoder = TextEncoder::new();
}

pub fn register() {
    REGISTRY
        .register(Box::new(VIEWERS_CONNECTED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CLIENTS_REGISTERED.clone()))
        .unwrap();
    REGISTRY.register(Box::new(OBSERVED_FPS.clone())).unwrap();
}

pub fn encode() -> String {
    ENCODER.encode_to_string(&REGISTRY.gather()).unwrap()
}
