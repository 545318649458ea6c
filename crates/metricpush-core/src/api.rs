//! gRPC surface: opaque byte-envelope messages and the generated
//! `metricpush.v1.Metrics` client/server.
//!
//! Payloads travel as the same gzip (and optionally RSA) framed JSON bytes the
//! HTTP transport uses, so both transports share one decoding path on the
//! server. Framing is announced through request metadata using the keys in
//! the crate root ([`crate::CONTENT_ENCODING`], [`crate::CONTENT_ENCRYPT`],
//! [`crate::REAL_IP`]).

/// Request envelope: a JSON [`crate::Metric`] or a JSON array of them.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub metric: Vec<u8>,
}

/// Response envelope for `GetMetric`: a JSON [`crate::Metric`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub metric: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

// The manual builder writes one file per service, named `<package>.<service>.rs`.
include!(concat!(env!("OUT_DIR"), "/metricpush.v1.Metrics.rs"));

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_request_envelope_preserves_bytes() {
        let req = MetricRequest {
            metric: vec![0x1f, 0x8b, 0x00, 0xff],
        };
        let bytes = req.encode_to_vec();
        let back = MetricRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(back.metric, vec![0x1f, 0x8b, 0x00, 0xff]);
    }

    #[test]
    fn test_empty_encodes_to_nothing() {
        assert!(Empty {}.encode_to_vec().is_empty());
    }
}
