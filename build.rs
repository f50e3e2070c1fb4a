fn main() {
    let method = |name: &str, route: &str, input: &str, output: &str| {
        tonic_build::manual::Method::builder()
            .name(name)
            .route_name(route)
            .input_type(input)
            .output_type(output)
            .codec_path("tonic::codec::ProstCodec")
    };

    let service = tonic_build::manual::Service::builder()
        .name("RemoteService")
        .package("remote.messaging")
        .method(
            method(
                "execute",
                "Execute",
                "crate::codec::Envelope",
                "crate::codec::Reply",
            )
            .build(),
        )
        .method(
            method(
                "execute_client_stream",
                "ExecuteClientStream",
                "crate::codec::Envelope",
                "crate::codec::Reply",
            )
            .client_streaming()
            .build(),
        )
        .method(
            method(
                "execute_server_stream",
                "ExecuteServerStream",
                "crate::codec::Envelope",
                "crate::codec::Reply",
            )
            .server_streaming()
            .build(),
        )
        .method(
            method(
                "subscribe",
                "Subscribe",
                "crate::transport::SubscribeRequest",
                "crate::codec::Envelope",
            )
            .server_streaming()
            .build(),
        )
        .method(
            method(
                "health",
                "Health",
                "crate::transport::HealthRequest",
                "crate::transport::HealthResponse",
            )
            .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
