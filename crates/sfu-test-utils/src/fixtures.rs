//! Negotiation parameter fixtures accepted by the local media engine.

use serde_json::{json, Value};

/// Client DTLS parameters with one SHA-256 fingerprint.
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF:01" }],
    })
}

/// Send-side RTP parameters for a VP8 video track.
pub fn video_rtp_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }],
        "encodings": [{ "ssrc": 1111 }],
    })
}

/// Send-side RTP parameters for an Opus audio track.
pub fn audio_rtp_parameters() -> Value {
    json!({
        "mid": "1",
        "codecs": [{ "mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2 }],
        "encodings": [{ "ssrc": 2222 }],
    })
}

/// Receive capabilities covering Opus and VP8.
pub fn receive_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 },
        ],
    })
}

/// Receive capabilities that match no room codec.
pub fn incompatible_capabilities() -> Value {
    json!({
        "codecs": [{ "kind": "video", "mimeType": "video/H264", "clockRate": 90000 }],
    })
}
