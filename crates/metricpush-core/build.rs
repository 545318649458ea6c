//! Generates the `metricpush.v1.Metrics` gRPC service.
//!
//! Messages are plain prost structs in `src/api.rs`, so the service is
//! described with the manual builder and no `protoc` is needed at build time.

use tonic_build::manual::{Builder, Method, Service};

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let service = Service::builder()
        .name("Metrics")
        .package("metricpush.v1")
        .method(unary(
            "update_metric",
            "UpdateMetric",
            "crate::api::MetricRequest",
            "crate::api::Empty",
        ))
        .method(unary(
            "update_metrics",
            "UpdateMetrics",
            "crate::api::MetricRequest",
            "crate::api::Empty",
        ))
        .method(unary(
            "get_metric",
            "GetMetric",
            "crate::api::MetricRequest",
            "crate::api::MetricResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
}
