//! Terminal dispatch
//!
//! Once a request is classified, these routines apply the last front-end
//! concerns (URI normalization, aliases, X-Forwarded-For substitution, the
//! global client limit) and hand the client to an external collaborator
//! through the [`Dispatch`] trait. Admin paths are never refused by the
//! client limit; sources authenticate before attach; the stats feed falls
//! back to a plain listener attach when neither credential matches.

use log::{debug, info, warn};

use crate::auth;
use crate::client::{Client, Step};
use crate::config::IcemuxConfig;
use crate::connection::SendBufs;
use crate::http::{self, Request};
use crate::server::ServerContext;

/// Result of the source authentication hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAuth {
    /// Authenticated; attach the source now
    Accepted,
    /// An async authenticator owns the client
    Pending,
    /// Refused; answer 401
    Rejected,
}

/// Which stats feed a STATS client attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    /// Full feed (admin credentials)
    Full,
    /// Slave feed (relay credentials on /admin/streams)
    Slave,
}

/// The terminal collaborators this front-end hands clients to.
///
/// Every method that receives a [`Client`] by value owns it from then on,
/// including the call to [`ServerContext::unregister_client`] when it is
/// finally torn down.
pub trait Dispatch: Send + Sync {
    /// Attach a listener to a mount.
    fn add_listener(&self, ctx: &ServerContext, uri: &str, client: Client);

    /// Start source ingest on a mount. The client's buffer holds any stream
    /// bytes that arrived with the request headers.
    fn source_startup(&self, ctx: &ServerContext, mount: &str, client: Client);

    /// Authenticate a source before attach.
    fn auth_check_source(
        &self,
        ctx: &ServerContext,
        client: &mut Client,
        mount: &str,
    ) -> SourceAuth;

    /// Attach a stats feed listener.
    fn stats_listener(&self, ctx: &ServerContext, kind: StatsKind, client: Client);

    /// Handle an admin request (`/admin.cgi`, `/admin/*`).
    fn admin_request(&self, ctx: &ServerContext, uri: &str, client: Client);

    /// Serve a file mount directly (the Flash policy short-circuit).
    fn fileserve(&self, ctx: &ServerContext, mount: &str, client: Client);
}

/// Route a GET/HEAD request.
pub fn route_get(ctx: &ServerContext, mut client: Client, req: Request) -> Step {
    let uri = match http::normalize_uri(req.uri()) {
        Some(uri) => uri,
        None => return client.send_400(ctx, "invalid request URI"),
    };
    debug!("start with {}", uri);

    let config = ctx.config.snapshot();
    check_for_filtering(&mut client, &uri, &req, &config);
    let serverport = client.attrs.port;
    let serverhost = client.attrs.bind_address.clone();
    check_xforward(&mut client, &req, &config);
    let uri = apply_aliases(uri, serverport, serverhost.as_deref(), &config);

    let clients = ctx.client_count();
    let limit_reached = clients > config.client_limit;
    if limit_reached {
        warn!(
            "server client limit reached ({}/{}) for {}",
            config.client_limit, clients, client.connection.ip
        );
    }

    if uri == "/admin.cgi" || uri.starts_with("/admin/") {
        client.parser = Some(req);
        ctx.dispatch.admin_request(ctx, &uri, client);
        return Step::Consumed;
    }
    if limit_reached {
        return client.send_403(ctx, "Too many clients connected");
    }
    client.parser = Some(req);
    ctx.dispatch.add_listener(ctx, &uri, client);
    Step::Consumed
}

/// Route a SOURCE/PUT request, after source setup preserved any early
/// stream bytes.
pub fn route_source(ctx: &ServerContext, mut client: Client) -> Step {
    let Some(req) = client.parser.clone() else {
        return Step::Closed(client);
    };
    let uri = req.uri().to_string();
    info!("Source logging in at mountpoint \"{}\"", uri);

    let config = ctx.config.snapshot();
    check_xforward(&mut client, &req, &config);

    if !uri.starts_with('/') {
        warn!("source mountpoint not starting with /");
        return client.send_401(ctx);
    }
    match ctx.dispatch.auth_check_source(ctx, &mut client, &uri) {
        SourceAuth::Accepted => {
            ctx.dispatch.source_startup(ctx, &uri, client);
            Step::Consumed
        }
        SourceAuth::Pending => Step::Consumed,
        SourceAuth::Rejected => {
            info!("Source ({}) attempted to login with invalid or missing password", uri);
            client.send_401(ctx)
        }
    }
}

/// Route a STATS request: admin credentials get the full feed, relay
/// credentials on /admin/streams the slave feed, anything else attaches as
/// a plain listener.
pub fn route_stats(ctx: &ServerContext, mut client: Client, req: Request) -> Step {
    let config = ctx.config.snapshot();
    if auth::check_admin_pass(&req, &config) {
        client.parser = Some(req);
        ctx.dispatch.stats_listener(ctx, StatsKind::Full, client);
        return Step::Consumed;
    }
    let uri = req.uri().to_string();
    if uri == "/admin/streams" && auth::check_relay_pass(&req, &config) {
        client.parser = Some(req);
        ctx.dispatch.stats_listener(ctx, StatsKind::Slave, client);
        return Step::Consumed;
    }
    client.parser = Some(req);
    ctx.dispatch.add_listener(ctx, &uri, client);
    Step::Consumed
}

/// Hand a client to the file-serve collaborator.
pub fn fileserve(ctx: &ServerContext, client: Client, mount: &str) -> Step {
    ctx.dispatch.fileserve(ctx, mount, client);
    Step::Consumed
}

/// FLV hint and access-log exclusion.
fn check_for_filtering(client: &mut Client, uri: &str, req: &Request, config: &IcemuxConfig) {
    let extension = uri.rsplit_once('.').map(|(_, ext)| ext);
    let query_type = req.query_param("type");
    if extension == Some("flv") || matches!(query_type, Some(".flv") | Some(".fla")) {
        client.flags.wants_flv = true;
        debug!("listener has requested FLV");
    }
    let (Some(ext), Some(pattern)) = (extension, config.access_log.exclude_ext.as_deref())
    else {
        return;
    };
    if pattern.split_whitespace().any(|p| p == ext) {
        client.flags.skip_accesslog = true;
    }
}

/// Substitute the peer IP from X-Forwarded-For, but only when the immediate
/// peer is a configured trusted forwarder.
fn check_xforward(client: &mut Client, req: &Request, config: &IcemuxConfig) {
    let Some(header) = req.header("x-forwarded-for") else { return };
    if config.xforward.iter().any(|peer| *peer == client.connection.ip) {
        let forwarded = header.split(',').next().unwrap_or(header).trim();
        if forwarded.is_empty() {
            return;
        }
        debug!("x-forward match for {}, using {} instead", client.connection.ip, forwarded);
        client.connection.ip = forwarded.to_string();
    }
}

/// First matching alias rewrites the URI; port and bind address narrow the
/// match when present.
fn apply_aliases(uri: String, port: u16, host: Option<&str>, config: &IcemuxConfig) -> String {
    for alias in &config.aliases {
        if alias.source == uri
            && alias.port.map_or(true, |p| p == port)
            && alias.bind_address.as_deref().map_or(true, |b| Some(b) == host)
        {
            debug!("alias has made {} into {}", uri, alias.destination);
            return alias.destination.clone();
        }
    }
    uri
}

/// Stand-alone collaborator: refuses every mount politely so the front-end
/// runs without a media backend attached, and serves the permissive Flash
/// policy document.
pub struct DefaultDispatch;

impl DefaultDispatch {
    fn refuse(&self, ctx: &ServerContext, mut client: Client, status: &str, body: &str) {
        let mut bufs = SendBufs::with_capacity(2);
        bufs.append(format!(
            "HTTP/1.0 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            status,
            body.len() + 2
        ));
        bufs.append(format!("{}\r\n", body));
        let _ = bufs.send(&mut client.connection, 0);
        ctx.unregister_client();
    }
}

impl Dispatch for DefaultDispatch {
    fn add_listener(&self, ctx: &ServerContext, uri: &str, client: Client) {
        info!("no handler for mount {}, refusing listener at {}", uri, client.connection.ip);
        self.refuse(ctx, client, "404 File Not Found", "No such mountpoint");
    }

    fn source_startup(&self, ctx: &ServerContext, mount: &str, client: Client) {
        info!("no media backend, refusing source for {}", mount);
        self.refuse(ctx, client, "404 File Not Found", "No such mountpoint");
    }

    fn auth_check_source(
        &self,
        ctx: &ServerContext,
        client: &mut Client,
        _mount: &str,
    ) -> SourceAuth {
        let config = ctx.config.snapshot();
        let authed = client
            .parser
            .as_ref()
            .map(|req| auth::check_source_pass(req, &config))
            .unwrap_or(false);
        if authed {
            SourceAuth::Accepted
        } else {
            SourceAuth::Rejected
        }
    }

    fn stats_listener(&self, ctx: &ServerContext, _kind: StatsKind, client: Client) {
        self.refuse(ctx, client, "404 File Not Found", "Stats not available");
    }

    fn admin_request(&self, ctx: &ServerContext, uri: &str, client: Client) {
        info!("no admin backend for {}", uri);
        self.refuse(ctx, client, "404 File Not Found", "Admin not available");
    }

    fn fileserve(&self, ctx: &ServerContext, mount: &str, mut client: Client) {
        if mount == "/flashpolicy" {
            let policy = "<?xml version=\"1.0\"?>\n<cross-domain-policy>\
                          <allow-access-from domain=\"*\" to-ports=\"*\" />\
                          </cross-domain-policy>\0";
            let _ = client.connection.send(policy.as_bytes());
            ctx.unregister_client();
            return;
        }
        self.refuse(ctx, client, "404 File Not Found", "No such file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AliasConfig, ConfigStore, IcemuxConfig};
    use crate::connection::transport::{MemStream, Transport};
    use crate::connection::Connection;
    use crate::listener::ListenerAttrs;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String, Client)>>,
    }

    impl Dispatch for Recorder {
        fn add_listener(&self, _ctx: &ServerContext, uri: &str, client: Client) {
            self.calls.lock().unwrap().push(("listener".into(), uri.into(), client));
        }
        fn source_startup(&self, _ctx: &ServerContext, mount: &str, client: Client) {
            self.calls.lock().unwrap().push(("source".into(), mount.into(), client));
        }
        fn auth_check_source(
            &self,
            _ctx: &ServerContext,
            _client: &mut Client,
            _mount: &str,
        ) -> SourceAuth {
            SourceAuth::Accepted
        }
        fn stats_listener(&self, _ctx: &ServerContext, kind: StatsKind, client: Client) {
            self.calls.lock().unwrap().push(("stats".into(), format!("{:?}", kind), client));
        }
        fn admin_request(&self, _ctx: &ServerContext, uri: &str, client: Client) {
            self.calls.lock().unwrap().push(("admin".into(), uri.into(), client));
        }
        fn fileserve(&self, _ctx: &ServerContext, mount: &str, client: Client) {
            self.calls.lock().unwrap().push(("fileserve".into(), mount.into(), client));
        }
    }

    fn context(config: IcemuxConfig) -> (Arc<ServerContext>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let ctx = ServerContext::new(ConfigStore::new(config), recorder.clone());
        (ctx, recorder)
    }

    fn client_on(ctx: &ServerContext, ip: &str, port: u16) -> Client {
        let con = Connection::new(Transport::Mem(MemStream::new(b"")), ip, ctx.now_ms());
        let attrs = Arc::new(ListenerAttrs {
            port,
            bind_address: None,
            tls: false,
            shoutcast_compat: false,
            shoutcast_mount: "/stream".to_string(),
        });
        Client::new(con, attrs, ctx.now_ms(), 15_000)
    }

    fn get_request(uri: &str, extra: &str) -> Request {
        let raw = format!("GET {} HTTP/1.0\r\n{}\r\n", uri, extra);
        Request::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_client_limit_spares_admin_paths() {
        let mut config = IcemuxConfig::default();
        config.client_limit = 1;
        let (ctx, rec) = context(config);
        for _ in 0..3 {
            ctx.register_client();
        }

        let client = client_on(&ctx, "10.0.0.1", 8000);
        let step = route_get(&ctx, client, get_request("/admin/stats", ""));
        assert!(matches!(step, Step::Consumed));
        {
            let calls = rec.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].0, "admin");
            assert_eq!(calls[0].1, "/admin/stats");
        }

        let client = client_on(&ctx, "10.0.0.1", 8000);
        let step = route_get(&ctx, client, get_request("/stream.ogg", ""));
        match step {
            Step::Closed(client) => assert_eq!(client.respcode, 403),
            _ => panic!("expected a 403 refusal"),
        }
        assert_eq!(rec.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_admin_cgi_exempt_from_limit() {
        let mut config = IcemuxConfig::default();
        config.client_limit = 0;
        let (ctx, rec) = context(config);
        ctx.register_client();
        let client = client_on(&ctx, "10.0.0.1", 8000);
        assert!(matches!(
            route_get(&ctx, client, get_request("/admin.cgi", "")),
            Step::Consumed
        ));
        assert_eq!(rec.calls.lock().unwrap()[0].0, "admin");
    }

    #[test]
    fn test_xforward_only_from_trusted_peer() {
        let mut config = IcemuxConfig::default();
        config.xforward = vec!["10.0.0.1".to_string()];
        let (ctx, rec) = context(config);

        let client = client_on(&ctx, "10.0.0.1", 8000);
        let req = get_request("/s", "X-Forwarded-For: 192.0.2.9, 10.0.0.1\r\n");
        assert!(matches!(route_get(&ctx, client, req), Step::Consumed));

        let client = client_on(&ctx, "172.16.0.1", 8000);
        let req = get_request("/s", "X-Forwarded-For: 192.0.2.9\r\n");
        assert!(matches!(route_get(&ctx, client, req), Step::Consumed));

        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls[0].2.connection.ip, "192.0.2.9");
        assert_eq!(calls[1].2.connection.ip, "172.16.0.1");
    }

    #[test]
    fn test_alias_rewrite_with_port_match() {
        let mut config = IcemuxConfig::default();
        config.aliases = vec![
            AliasConfig {
                source: "/".to_string(),
                destination: "/other.ogg".to_string(),
                port: Some(9000),
                bind_address: None,
            },
            AliasConfig {
                source: "/".to_string(),
                destination: "/status.xsl".to_string(),
                port: None,
                bind_address: None,
            },
        ];
        let (ctx, rec) = context(config);

        // port 8000 skips the first alias, matches the second
        let client = client_on(&ctx, "10.0.0.1", 8000);
        assert!(matches!(route_get(&ctx, client, get_request("/", "")), Step::Consumed));
        // port 9000 takes the first
        let client = client_on(&ctx, "10.0.0.1", 9000);
        assert!(matches!(route_get(&ctx, client, get_request("/", "")), Step::Consumed));

        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls[0].1, "/status.xsl");
        assert_eq!(calls[1].1, "/other.ogg");
    }

    #[test]
    fn test_flv_hint_and_accesslog_exclusion() {
        let mut config = IcemuxConfig::default();
        config.access_log.exclude_ext = Some("gif png".to_string());
        let (ctx, rec) = context(config);

        let client = client_on(&ctx, "10.0.0.1", 8000);
        let req = get_request("/clip.flv", "");
        assert!(matches!(route_get(&ctx, client, req), Step::Consumed));

        let client = client_on(&ctx, "10.0.0.1", 8000);
        let req = get_request("/s?type=.fla", "");
        assert!(matches!(route_get(&ctx, client, req), Step::Consumed));

        let client = client_on(&ctx, "10.0.0.1", 8000);
        let req = get_request("/img.png", "");
        assert!(matches!(route_get(&ctx, client, req), Step::Consumed));

        let calls = rec.calls.lock().unwrap();
        assert!(calls[0].2.flags.wants_flv);
        assert!(calls[1].2.flags.wants_flv);
        assert!(!calls[1].2.flags.skip_accesslog);
        assert!(calls[2].2.flags.skip_accesslog);
        assert!(!calls[2].2.flags.wants_flv);
    }

    #[test]
    fn test_bad_uri_gets_400() {
        let (ctx, _rec) = context(IcemuxConfig::default());
        let client = client_on(&ctx, "10.0.0.1", 8000);
        let req = get_request("/../secret", "");
        match route_get(&ctx, client, req) {
            Step::Closed(client) => assert_eq!(client.respcode, 400),
            _ => panic!("expected a 400"),
        }
    }

    #[test]
    fn test_stats_fallback_to_listener() {
        let (ctx, rec) = context(IcemuxConfig::default());
        let client = client_on(&ctx, "10.0.0.1", 8000);
        let req = Request::parse(b"STATS /stream.ogg HTTP/1.0\r\n\r\n").unwrap();
        assert!(matches!(route_stats(&ctx, client, req), Step::Consumed));
        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls[0].0, "listener");
        assert_eq!(calls[0].1, "/stream.ogg");
    }

    #[test]
    fn test_stats_slave_with_relay_pass() {
        let mut config = IcemuxConfig::default();
        config.relay_password = Some("hackme".to_string());
        let (ctx, rec) = context(config);
        let client = client_on(&ctx, "10.0.0.1", 8000);
        // relay:hackme
        let req = Request::parse(
            b"STATS /admin/streams HTTP/1.0\r\nAuthorization: Basic cmVsYXk6aGFja21l\r\n\r\n",
        )
        .unwrap();
        assert!(matches!(route_stats(&ctx, client, req), Step::Consumed));
        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls[0].0, "stats");
        assert_eq!(calls[0].1, "Slave");
    }
}
