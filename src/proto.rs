//! Wire envelope.
//!
//! Declared by hand with prost derives so the crate builds without `protoc`.
//! Equivalent schema:
//!
//! ```proto
//! syntax = "proto3";
//! package proto_messaging;
//!
//! import "google/protobuf/any.proto";
//!
//! message Envelope {
//!   string payload_type_name = 1;
//!   google.protobuf.Any payload = 2;
//!   string origin_topic = 3;
//!   string traceability_id = 4;
//! }
//! ```

/// Self-describing wrapper carrying one packed payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Fully-qualified protobuf name of the packed payload.
    #[prost(string, tag = "1")]
    pub payload_type_name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub payload: ::core::option::Option<::prost_types::Any>,
    /// Topic the sender considers itself to publish from (may be empty).
    #[prost(string, tag = "3")]
    pub origin_topic: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub traceability_id: ::prost::alloc::string::String,
}

impl ::prost::Name for Envelope {
    const NAME: &'static str = "Envelope";
    const PACKAGE: &'static str = "proto_messaging";

    fn full_name() -> ::prost::alloc::string::String {
        "proto_messaging.Envelope".into()
    }

    fn type_url() -> ::prost::alloc::string::String {
        "type.googleapis.com/proto_messaging.Envelope".into()
    }
}
