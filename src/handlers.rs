// src/handlers.rs
//
// Worker-side request handling: CORS decoration, the static handler over
// the versioned store, and dynamic dispatch of named actions.

use std::collections::BTreeMap;

use tracing::debug;

use crate::conn::Session;
use crate::error::{VersoError, VersoResult};
use crate::http::{self, Method, Request};
use crate::json::Json;
use crate::parser;
use crate::response::{BodyLength, Response};
use crate::server::ServerState;
use crate::stream::Stream;
use crate::worker::Outcome;

pub const SERVER: &str = "verso/0.1";

const ALLOW_HEADERS: &str =
    "Cache-Control, X-Requested-With, Filename, Filesize, Content-Type, Content-Length, \
     Authorization, Range";
const ALLOW_METHODS: &str = "GET, POST, OPTIONS, PUT, DELETE, SUBSCRIBE, NOTIFY";

type ActionFn = fn(&Request, &mut Response, &mut Stream, &ServerState, &Json) -> VersoResult<()>;

// One handler per action name. Sorted by name: lookup is by binary search.
static ACTIONS: &[(&str, ActionFn)] = &[
    ("content.get_version", action_content_get_version),
    ("example.hello_world", action_example_hello_world),
];

/// Runs one parsed request to completion and reports how the dispatcher
/// should treat the connection afterwards.
pub fn serve(session: &mut Session, state: &ServerState) -> Outcome {
    match serve_inner(session, state) {
        Ok(outcome) => outcome,
        Err(error) => {
            debug!(error = %error, "aborting connection");
            Outcome::Abort
        }
    }
}

// The Err path means no response could be sent at all.
fn serve_inner(session: &mut Session, state: &ServerState) -> VersoResult<Outcome> {
    let Session {
        stream, context, ..
    } = session;
    let request = &mut context.request;

    state.metrics.request_served();

    // Remember to terminate the connection if the client asked for it.
    let mut last = request.header("connection") == Some("close");

    let mut response = Response::new();

    // The fresh header buffer has room for these; treat failure as fatal.
    response.header_add("Server", SERVER)?;

    // Allow cross-origin requests.
    let origin = request.header("origin").is_some();
    if origin {
        response.header_add("Access-Control-Allow-Origin", "*")?;
        response.header_add("Access-Control-Expose-Headers", "Server, UUID")?;
    }

    let status: VersoResult<()> = if request.method == Some(Method::Options) {
        response.header_add("Access-Control-Allow-Headers", ALLOW_HEADERS)?;
        if !origin {
            response.header_add("Access-Control-Expose-Headers", "Server, UUID")?;
        }
        response.header_add("Access-Control-Allow-Methods", ALLOW_METHODS)?;
        response.code = http::OK;
        Ok(())
    } else {
        match parser::parse_uri(request) {
            Err(error) => Err(error),
            Ok(()) => {
                response.code = http::INTERNAL_SERVER_ERROR;
                let result = if request.query.is_some() {
                    handler_dynamic(request, &mut response, stream, state)
                } else {
                    handler_static(request, &mut response, stream, state)
                };

                // An error after an upload leaves unread body bytes on the
                // wire; the connection cannot be reused.
                if result.is_err()
                    && matches!(request.method, Some(Method::Post) | Some(Method::Put))
                {
                    let _ = response.header_add("Connection", "close");
                    last = true;
                }
                result
            }
        }
    };

    match status {
        Ok(()) => {}
        Err(VersoError::Progress) => {
            // The handler owns the transmission now; nothing more to send.
            return Ok(if last { Outcome::Close } else { Outcome::KeepAlive });
        }
        Err(VersoError::Cancel) => {
            let _ = response.header_add("Connection", "close");
            last = true;
            response.code = http::OK;
        }
        Err(VersoError::Gateway) => {
            let _ = response.header_add("Connection", "close");
            last = true;
            response.code = http::BAD_GATEWAY;
        }
        // No response is possible for these.
        Err(VersoError::Memory) => return Err(VersoError::Memory),
        Err(VersoError::Network) => return Err(VersoError::Network),
        Err(error) => {
            response.code = error.http_status().unwrap_or(http::INTERNAL_SERVER_ERROR);
        }
    }

    // Send the default response unless a handler already took over.
    if !response.committed() {
        response.headers_send(stream, request, BodyLength::Known(0))?;
    }

    Ok(if last { Outcome::Close } else { Outcome::KeepAlive })
}

fn handler_static(
    request: &mut Request,
    response: &mut Response,
    stream: &mut Stream,
    state: &ServerState,
) -> VersoResult<()> {
    check_path(&request.path)?;
    let name = object_name(&request.path);

    if request.method == Some(Method::Post) {
        let length = match request.content_length() {
            None => return Err(VersoError::Status(http::LENGTH_REQUIRED)),
            Some(Err(())) => return Err(VersoError::Status(http::BAD_REQUEST)),
            Some(Ok(length)) => length,
        };
        response.code = http::OK;
        state.storage.set(name, stream, length)
    } else {
        let info = state.storage.get(name)?;
        response.code = http::OK;
        response.headers_send(stream, request, BodyLength::Known(info.size()))?;
        response.entity_send(stream, info.bytes())
    }
}

fn handler_dynamic(
    request: &mut Request,
    response: &mut Response,
    stream: &mut Stream,
    state: &ServerState,
) -> VersoResult<()> {
    if request.path.first() != Some(&b'/') {
        return Err(VersoError::Missing);
    }

    // The only accepted query shape is an object whose "actions" member maps
    // action names to their parameters.
    let bad = VersoError::Status(http::BAD_REQUEST);
    let query = request.query.as_ref().ok_or(bad)?;
    let query = query.as_object().ok_or(bad)?;
    let actions = query
        .get("actions")
        .and_then(Json::as_object)
        .ok_or(bad)?;

    // Clients request one action at a time; extra entries are ignored.
    let Some((name, parameters)) = actions.iter().next() else {
        return Err(VersoError::Status(http::NOT_FOUND));
    };

    match ACTIONS.binary_search_by(|(action, _)| (*action).cmp(name.as_str())) {
        Ok(index) => (ACTIONS[index].1)(request, response, stream, state, parameters),
        Err(_) => Err(VersoError::Status(http::NOT_FOUND)),
    }
}

// Reject dotfiles and dot segments outright.
fn check_path(path: &[u8]) -> VersoResult<()> {
    if path.first() == Some(&b'.') || path.windows(2).any(|w| w == b"/.") {
        return Err(VersoError::Status(http::FORBIDDEN));
    }
    Ok(())
}

fn object_name(path: &[u8]) -> &[u8] {
    path.strip_prefix(b"/").unwrap_or(path)
}

fn action_content_get_version(
    request: &Request,
    response: &mut Response,
    stream: &mut Stream,
    state: &ServerState,
    _parameters: &Json,
) -> VersoResult<()> {
    check_path(&request.path)?;
    let info = state.storage.get(object_name(&request.path))?;

    let mut body = BTreeMap::new();
    body.insert(
        "version".to_string(),
        Json::Integer(info.version() as i64),
    );
    let entity = Json::Object(body).serialize();

    response.code = http::OK;
    response.headers_send(stream, request, BodyLength::Known(entity.len() as u64))?;
    response.entity_send(stream, &entity)
}

fn action_example_hello_world(
    request: &Request,
    response: &mut Response,
    stream: &mut Stream,
    _state: &ServerState,
    _parameters: &Json,
) -> VersoResult<()> {
    let entity = b"Hello world!\n";
    response.code = http::OK;
    response.headers_send(stream, request, BodyLength::Known(entity.len() as u64))?;
    response.entity_send(stream, entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls;
    use libc::{c_int, c_void};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn socket_pair() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let status =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(status, 0);
        (fds[0], fds[1])
    }

    fn send_raw(fd: c_int, data: &[u8]) {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const c_void, data.len()) };
        assert_eq!(n, data.len() as isize);
    }

    fn recv_available(fd: c_int) -> Vec<u8> {
        syscalls::set_nonblocking(fd).unwrap();
        let mut result = Vec::new();
        let mut chunk = [0u8; 16384];
        loop {
            let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut c_void, chunk.len()) };
            if n <= 0 {
                break;
            }
            result.extend_from_slice(&chunk[..n as usize]);
        }
        result
    }

    fn temp_state() -> ServerState {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let unique = format!(
            "verso-handlers-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let root: PathBuf = std::env::temp_dir().join(unique);
        std::fs::create_dir_all(&root).unwrap();
        ServerState::new(root)
    }

    // Parses one request off the wire and serves it, returning the raw
    // response bytes and the connection outcome.
    fn run_request(state: &ServerState, raw: &[u8]) -> (Vec<u8>, Outcome) {
        let (a, b) = socket_pair();
        let stream = crate::stream::Stream::new(a).unwrap();
        send_raw(b, raw);

        let peer = "127.0.0.1:1".parse().unwrap();
        let mut session = Session::new(stream, peer, 0);
        session.context.parse(&mut session.stream).unwrap();
        let outcome = serve(&mut session, state);

        let wire = recv_available(b);
        syscalls::close_fd(a);
        syscalls::close_fd(b);
        (wire, outcome)
    }

    fn text(wire: &[u8]) -> String {
        String::from_utf8_lossy(wire).into_owned()
    }

    fn body_of(wire: &[u8]) -> Vec<u8> {
        let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        wire[head_end + 4..].to_vec()
    }

    #[test]
    fn actions_table_is_sorted() {
        for window in ACTIONS.windows(2) {
            assert!(window[0].0 < window[1].0);
        }
    }

    #[test]
    fn post_then_get_round_trips_through_the_store() {
        let state = temp_state();

        let (wire, outcome) = run_request(
            &state,
            b"POST /item HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert!(text(&wire).starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(outcome, Outcome::KeepAlive);

        let (wire, _) = run_request(&state, b"GET /item HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(text(&wire).starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text(&wire).contains("Content-Length: 5\r\n"));
        assert_eq!(body_of(&wire), b"hello");
    }

    #[test]
    fn second_post_bumps_the_version() {
        let state = temp_state();
        run_request(
            &state,
            b"POST /item HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
        );

        // A reader holding the first version keeps it across the update.
        let old = state.storage.get(b"item").unwrap();

        run_request(
            &state,
            b"POST /item HTTP/1.1\r\nHost: h\r\nContent-Length: 6\r\n\r\nworld!",
        );
        let (wire, _) = run_request(&state, b"GET /item HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(body_of(&wire), b"world!");
        assert_eq!(old.bytes(), b"hello");
        assert_eq!(old.version(), 1);
    }

    #[test]
    fn post_without_content_length_is_length_required() {
        let state = temp_state();
        let (wire, outcome) = run_request(&state, b"POST /item HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(text(&wire).starts_with("HTTP/1.1 411 Length Required\r\n"));
        // Upload errors poison the connection.
        assert_eq!(outcome, Outcome::Close);
        assert!(text(&wire).contains("Connection: close\r\n"));
    }

    #[test]
    fn missing_object_is_not_found() {
        let state = temp_state();
        let (wire, outcome) = run_request(&state, b"GET /absent HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(text(&wire).starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(outcome, Outcome::KeepAlive);
    }

    #[test]
    fn dot_paths_are_forbidden() {
        let state = temp_state();
        for target in [&b"/.hidden"[..], b"/a/.b", b"/a/../b"] {
            let mut raw = b"GET ".to_vec();
            raw.extend_from_slice(target);
            raw.extend_from_slice(b" HTTP/1.1\r\nHost: h\r\n\r\n");
            let (wire, _) = run_request(&state, &raw);
            assert!(
                text(&wire).starts_with("HTTP/1.1 403 Forbidden\r\n"),
                "path {:?}",
                String::from_utf8_lossy(target)
            );
        }
    }

    #[test]
    fn head_gets_headers_only() {
        let state = temp_state();
        run_request(
            &state,
            b"POST /item HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
        );
        let (wire, _) = run_request(&state, b"HEAD /item HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(text(&wire).starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body_of(&wire), b"");
    }

    #[test]
    fn range_get_returns_partial_content() {
        let state = temp_state();
        let blob: Vec<u8> = (0u8..100).collect();
        let mut upload = b"POST /blob HTTP/1.1\r\nHost: h\r\nContent-Length: 100\r\n\r\n".to_vec();
        upload.extend_from_slice(&blob);
        run_request(&state, &upload);

        let (wire, _) = run_request(
            &state,
            b"GET /blob HTTP/1.1\r\nHost: h\r\nRange: bytes=10-19,15-25\r\n\r\n",
        );
        let head = text(&wire);
        assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(head.contains("Content-Range: bytes 10-25/100\r\n"));
        assert_eq!(body_of(&wire), &blob[10..26]);
    }

    #[test]
    fn unsatisfiable_range_is_416() {
        let state = temp_state();
        let blob = vec![7u8; 100];
        let mut upload = b"POST /blob HTTP/1.1\r\nHost: h\r\nContent-Length: 100\r\n\r\n".to_vec();
        upload.extend_from_slice(&blob);
        run_request(&state, &upload);

        let (wire, _) = run_request(
            &state,
            b"GET /blob HTTP/1.1\r\nHost: h\r\nRange: bytes=200-300\r\n\r\n",
        );
        assert!(text(&wire).starts_with("HTTP/1.1 416 Requested Range Not Satisfiable\r\n"));
    }

    #[test]
    fn cors_preflight() {
        let state = temp_state();
        let (wire, outcome) = run_request(
            &state,
            b"OPTIONS /* HTTP/1.1\r\nHost: h\r\nOrigin: https://a\r\n\r\n",
        );
        let head = text(&wire);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(head.contains("Access-Control-Expose-Headers: Server, UUID\r\n"));
        assert!(head.contains(
            "Access-Control-Allow-Methods: GET, POST, OPTIONS, PUT, DELETE, SUBSCRIBE, NOTIFY\r\n"
        ));
        assert!(head.contains("Access-Control-Allow-Headers: "));
        assert!(head.contains("Content-Length: 0\r\n"));
        assert_eq!(outcome, Outcome::KeepAlive);
    }

    #[test]
    fn origin_header_enables_cors_on_plain_requests() {
        let state = temp_state();
        run_request(
            &state,
            b"POST /item HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\nok",
        );
        let (wire, _) = run_request(
            &state,
            b"GET /item HTTP/1.1\r\nHost: h\r\nOrigin: https://a\r\n\r\n",
        );
        let head = text(&wire);
        assert!(head.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(head.contains("Server: verso/0.1\r\n"));
    }

    #[test]
    fn dynamic_get_version_action() {
        let state = temp_state();
        run_request(
            &state,
            b"POST /item HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
        );

        // /item?{"actions":{"content.get_version":null}} with the query
        // percent-encoded.
        let query = br#"{"actions":{"content.get_version":null}}"#;
        let mut raw = b"GET /item?".to_vec();
        raw.extend_from_slice(&http::uri_encode(query));
        raw.extend_from_slice(b" HTTP/1.1\r\nHost: h\r\n\r\n");

        let (wire, _) = run_request(&state, &raw);
        assert!(text(&wire).starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body_of(&wire), br#"{"version":1}"#);
    }

    #[test]
    fn dynamic_hello_world_action() {
        let state = temp_state();
        let query = br#"{"actions":{"example.hello_world":{}}}"#;
        let mut raw = b"GET /x?".to_vec();
        raw.extend_from_slice(&http::uri_encode(query));
        raw.extend_from_slice(b" HTTP/1.1\r\nHost: h\r\n\r\n");

        let (wire, _) = run_request(&state, &raw);
        assert_eq!(body_of(&wire), b"Hello world!\n");
    }

    #[test]
    fn unknown_action_is_not_found() {
        let state = temp_state();
        let query = br#"{"actions":{"nope.missing":null}}"#;
        let mut raw = b"GET /x?".to_vec();
        raw.extend_from_slice(&http::uri_encode(query));
        raw.extend_from_slice(b" HTTP/1.1\r\nHost: h\r\n\r\n");

        let (wire, _) = run_request(&state, &raw);
        assert!(text(&wire).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn query_without_actions_object_is_bad_request() {
        let state = temp_state();
        let query = br#"{"other":1}"#;
        let mut raw = b"GET /x?".to_vec();
        raw.extend_from_slice(&http::uri_encode(query));
        raw.extend_from_slice(b" HTTP/1.1\r\nHost: h\r\n\r\n");

        let (wire, _) = run_request(&state, &raw);
        assert!(text(&wire).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn connection_close_is_honoured() {
        let state = temp_state();
        run_request(
            &state,
            b"POST /item HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\nok",
        );
        let (wire, outcome) = run_request(
            &state,
            b"GET /item HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
        );
        assert!(text(&wire).starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(outcome, Outcome::Close);
    }

    #[test]
    fn absolute_uri_requests_are_served() {
        let state = temp_state();
        run_request(
            &state,
            b"POST /item HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\nok",
        );
        let (wire, _) = run_request(
            &state,
            b"GET http://any.host/item HTTP/1.1\r\nHost: ignored\r\n\r\n",
        );
        assert!(text(&wire).starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body_of(&wire), b"ok");
    }
}
