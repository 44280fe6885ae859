use micro_reactor::EventLoop;
use micro_reactor_http::handler::make_application;
use micro_reactor_http::protocol::Environ;
use micro_reactor_http::server::HttpServer;
use micro_reactor_http::{SendBody, StartResponse};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

// curl -v http://127.0.0.1:8080/hello?name=world
// curl -v -d "some body" http://127.0.0.1:8080/upload
fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let event_loop = EventLoop::new().expect("failed to create event loop");
    let server = HttpServer::builder()
        .event_loop(event_loop.clone())
        .application(make_application(hello_world))
        .interface("127.0.0.1")
        .port(8080)
        .build()
        .expect("server is fully configured");

    if let Err(e) = server.start() {
        error!(cause = %e, "bind server error");
        return;
    }

    if let Err(e) = event_loop.run_forever() {
        error!(cause = %e, "event loop stopped");
    }
}

fn hello_world(environ: Environ, start_response: StartResponse, send_body: SendBody) {
    info!(method = environ.request_method(), path = environ.path_info(), "request");

    let mut received = Vec::new();
    environ.input().register(move |data| {
        if !data.is_empty() {
            received.extend_from_slice(&data);
            return;
        }

        info!(body = %String::from_utf8_lossy(&received), "receiving request body");
        let body = "Hello World!\r\n";
        start_response.start("200 OK", &[("Content-Type", "text/plain"), ("Content-Length", &body.len().to_string())]);
        send_body.send(body.as_bytes());
        send_body.finish();
    });
}
