//! HTTP control path.
//!
//! One request per connection: a `GET` either selects a channel (the
//! connection then turns into a raw MPEG-TS stream preceded by a fixed
//! preamble) or fetches one of the informational pages, which are served
//! and closed. Anything else is a 501.

use std::io::Write;

use crate::channel::{Channel, resolve_channel_path};
use crate::engine::{HandlerOutcome, UnicastEngine};
use crate::reply::Reply;

/// Preamble written to an HTTP client right before streaming starts.
pub(crate) const HTTP_OK_PREAMBLE: &str = "HTTP/1.0 200 OK\r\nContent-type: video/mpeg\r\n\r\n";

pub(crate) const HTTP_501_REPLY: &str = "HTTP/1.0 501 Not implemented\r\n\r\n";
pub(crate) const HTTP_503_REPLY: &str = "HTTP/1.0 503 Too many clients\r\n\r\n";

/// Handle one complete buffered HTTP request.
pub(crate) fn handle_request(
    engine: &mut UnicastEngine,
    id: usize,
    channels: &mut [Channel],
) -> HandlerOutcome {
    let (request, peer_addr, asked_channel, attached, local_addr) = {
        let Some(client) = engine.registry.get_mut(id) else {
            return HandlerOutcome::CloseConnection;
        };
        let request = String::from_utf8_lossy(&client.recv).into_owned();
        client.reset_recv();
        (
            request,
            client.peer_addr(),
            client.asked_channel,
            client.channel(),
            client.stream.local_addr().ok(),
        )
    };

    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let (method, uri) = (parts.next(), parts.next());
    let (Some("GET"), Some(uri)) = (method, uri) else {
        tracing::info!(%peer_addr, method = method.unwrap_or(""), "unsupported HTTP method");
        if let Some(client) = engine.registry.get_mut(id) {
            let _ = client.stream.write(HTTP_501_REPLY.as_bytes());
        }
        // a streaming connection survives a stray non-GET request
        return if attached.is_some() {
            HandlerOutcome::KeepOpen
        } else {
            HandlerOutcome::CloseConnection
        };
    };

    // a dedicated per-channel socket decided the channel at accept time
    let target = asked_channel.or_else(|| resolve_channel_path(uri, channels));
    if let Some(chan_idx) = target {
        if channels.get(chan_idx).is_none() {
            tracing::error!(chan_idx, "asked channel does not exist");
            return send_page(engine, id, not_found_page(), 404, "text/html");
        }
        if attached.is_some() {
            tracing::info!(%peer_addr, "streaming client asked for another channel");
            if let Some(client) = engine.registry.get_mut(id) {
                let _ = client.stream.write(HTTP_501_REPLY.as_bytes());
            }
            return HandlerOutcome::CloseConnection;
        }
        return match engine.registry.attach(id, chan_idx, channels) {
            Ok(()) => HandlerOutcome::KeepOpen,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "streaming preamble write failed");
                HandlerOutcome::CloseConnection
            }
        };
    }

    let host = host_header(&request)
        .map(str::to_string)
        .or_else(|| local_addr.map(|a| a.to_string()));
    let host = host.as_deref().unwrap_or("localhost");

    match uri {
        "/channels_list.html" => {
            send_page(engine, id, channels_list_page(channels, host), 200, "text/html")
        }
        "/playlist.m3u" => send_page(engine, id, playlist_page(channels, host), 200, "audio/x-mpegurl"),
        "/playlist_port.m3u" => {
            let host_ip = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
            send_page(engine, id, playlist_port_page(channels, host_ip), 200, "audio/x-mpegurl")
        }
        "/" | "/index.html" => send_page(engine, id, index_page(), 200, "text/html"),
        _ => {
            tracing::info!(%peer_addr, uri, "unknown HTTP path");
            send_page(engine, id, not_found_page(), 404, "text/html")
        }
    }
}

/// Send a finalized page and close; pages are one-shot.
fn send_page(
    engine: &mut UnicastEngine,
    id: usize,
    reply: Reply,
    code: u16,
    content_type: &str,
) -> HandlerOutcome {
    if let Some(client) = engine.registry.get_mut(id) {
        if let Err(e) = reply.send_http(code, content_type, &mut client.stream) {
            tracing::debug!(peer_addr = %client.peer_addr(), error = %e, "page write failed");
        }
    }
    HandlerOutcome::CloseConnection
}

/// Value of the `Host:` header, if the request carries one.
fn host_header(request: &str) -> Option<&str> {
    request.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("Host") {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn html_head(reply: &mut Reply, title: &str) {
    reply.append_body(format_args!(
        "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.0 Strict//EN\" \"http://www.w3.org/TR/xhtml10/DTD/xhtml10strict.dtd\">\r\n"
    ));
    reply.append_body(format_args!(
        "<html lang=\"en\">\r\n<head>\r\n<title>{}</title>\r\n</head>\r\n<body>\r\n",
        title
    ));
}

fn html_tail(reply: &mut Reply) {
    reply.append_body(format_args!("</body>\r\n</html>\r\n"));
}

fn not_found_page() -> Reply {
    let mut reply = Reply::new();
    html_head(&mut reply, "Not found");
    reply.append_body(format_args!("   <h1>404 Not found</h1>\r\n<hr />\r\n"));
    html_tail(&mut reply);
    reply
}

fn index_page() -> Reply {
    let mut reply = Reply::new();
    html_head(&mut reply, "Server index");
    reply.append_body(format_args!("   <h1>Available URLs</h1>\r\n<hr />\r\n"));
    for url in [
        "/bynumber/&lt;number&gt;",
        "/bysid/&lt;sid&gt;",
        "/byname/&lt;name&gt;",
        "/channels_list.html",
        "/playlist.m3u",
        "/playlist_port.m3u",
    ] {
        reply.append_body(format_args!("{}<br />\r\n", url));
    }
    html_tail(&mut reply);
    reply
}

fn channels_list_page(channels: &[Channel], host: &str) -> Reply {
    let mut reply = Reply::new();
    html_head(&mut reply, "Channels list");
    reply.append_body(format_args!("   <h1>Channel list</h1>\r\n<hr />\r\n"));
    for (number, channel) in channels.iter().enumerate() {
        if channel.name.is_empty() {
            continue;
        }
        reply.append_body(format_args!(
            "{}: <a href=\"http://{}/bynumber/{}\">{}</a> (sid {})<br />\r\n",
            number + 1,
            host,
            number + 1,
            channel.name,
            channel.service_id
        ));
    }
    reply.append_body(format_args!("<hr />\r\n"));
    html_tail(&mut reply);
    reply
}

fn playlist_page(channels: &[Channel], host: &str) -> Reply {
    let mut reply = Reply::new();
    reply.append_body(format_args!("#EXTM3U\r\n"));
    for (number, channel) in channels.iter().enumerate() {
        if channel.name.is_empty() {
            continue;
        }
        reply.append_body(format_args!(
            "#EXTINF:0,{}\r\nhttp://{}/bynumber/{}\r\n",
            channel.name,
            host,
            number + 1
        ));
    }
    reply
}

fn playlist_port_page(channels: &[Channel], host_ip: &str) -> Reply {
    let mut reply = Reply::new();
    reply.append_body(format_args!("#EXTM3U\r\n"));
    for channel in channels {
        let Some(port) = channel.unicast_port else {
            continue;
        };
        if channel.name.is_empty() {
            continue;
        }
        reply.append_body(format_args!(
            "#EXTINF:0,{}\r\nhttp://{}:{}/\r\n",
            channel.name, host_ip, port
        ));
    }
    reply
}
