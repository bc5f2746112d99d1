use crate::http::{
    header::{
        self, CacheDirective, ChallengeResponse, Cookie, Expectation, HeaderError, Preference,
        RangeSpec, RecipientInfo, Tag, Warning,
    },
    parser::Frame,
    types::{HeaderSet, Method, Protocol, Version},
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::SystemTime,
};
use tokio::sync::watch;

// CONNECTION

/// Facts about the connection a request arrived on.
///
/// Shared between the connection pump and every request it builds; the
/// request only ever reads it, apart from [`abort`](Self::abort).
#[derive(Debug)]
pub struct ConnectionInfo {
    remote: SocketAddr,
    local: SocketAddr,
    protocol: Protocol,
    use_forwarded_for: bool,
    aborted: watch::Sender<bool>,
}

impl ConnectionInfo {
    pub(crate) fn new(
        remote: SocketAddr,
        local: SocketAddr,
        protocol: Protocol,
        use_forwarded_for: bool,
    ) -> Self {
        ConnectionInfo {
            remote,
            local,
            protocol,
            use_forwarded_for,
            aborted: watch::channel(false).0,
        }
    }

    /// Address of the peer.
    #[inline(always)]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Address the connection was accepted on.
    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline(always)]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Asks the pump to close the connection instead of writing the pending
    /// response. A body that is already streaming is cut immediately, even
    /// while waiting for its producer.
    pub fn abort(&self) {
        self.aborted.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.aborted.borrow()
    }

    /// Receiver that flips to `true` on [`abort`](Self::abort).
    pub(crate) fn abort_signal(&self) -> watch::Receiver<bool> {
        self.aborted.subscribe()
    }
}

// FACETS

/// Independently lazy piece of derived request information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
    Headers,
    Host,
    OriginalReference,
    Reference,
    Date,
    Client,
    Conditions,
    Cookies,
    Ranges,
    Challenge,
    ProxyChallenge,
    Recipients,
    Warnings,
    Referrer,
    CacheDirectives,
    AccessControlHeaders,
    AccessControlMethod,
    Entity,
}

impl Facet {
    const COUNT: usize = Facet::Entity as usize + 1;
}

/// Lifecycle of one facet.
///
/// `Unparsed` moves to `Parsed` the first time the facet is read, and to
/// `Overridden` when a setter replaces it. Neither of the latter is ever left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetState {
    Unparsed,
    Parsed,
    Overridden,
}

#[derive(Debug, Clone)]
struct FacetTable {
    states: [FacetState; Facet::COUNT],
    parses: [u32; Facet::COUNT],
}

impl FacetTable {
    fn new() -> Self {
        FacetTable {
            states: [FacetState::Unparsed; Facet::COUNT],
            parses: [0; Facet::COUNT],
        }
    }

    /// Returns `true` exactly once per facet, unless it was overridden first.
    #[inline(always)]
    fn begin(&mut self, facet: Facet) -> bool {
        let state = &mut self.states[facet as usize];
        if *state != FacetState::Unparsed {
            return false;
        }

        *state = FacetState::Parsed;
        self.parses[facet as usize] += 1;
        true
    }

    #[inline(always)]
    fn override_with(&mut self, facet: Facet) {
        self.states[facet as usize] = FacetState::Overridden;
    }
}

// FACET VALUES

/// Who is asking and what they accept.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub address: IpAddr,
    pub port: u16,
    /// `X-Forwarded-For` chain in header order, when trusted
    pub forwarded_addresses: Vec<String>,
    pub agent: Option<String>,
    pub from: Option<String>,
    pub accepted_media_types: Vec<Preference>,
    pub accepted_character_sets: Vec<Preference>,
    pub accepted_encodings: Vec<Preference>,
    pub accepted_languages: Vec<Preference>,
    pub accepted_patches: Vec<Preference>,
    pub expectations: Vec<Expectation>,
}

impl ClientInfo {
    fn new(remote: SocketAddr) -> Self {
        ClientInfo {
            address: remote.ip(),
            port: remote.port(),
            forwarded_addresses: Vec::new(),
            agent: None,
            from: None,
            accepted_media_types: Vec::new(),
            accepted_character_sets: Vec::new(),
            accepted_encodings: Vec::new(),
            accepted_languages: Vec::new(),
            accepted_patches: Vec::new(),
            expectations: Vec::new(),
        }
    }
}

/// Conditional-request predicates.
///
/// Tag lists stay `None` until the first valid tag is read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    pub match_tags: Option<Vec<Tag>>,
    pub none_match_tags: Option<Vec<Tag>>,
    pub modified_since: Option<SystemTime>,
    pub unmodified_since: Option<SystemTime>,
    pub range_tag: Option<Tag>,
    pub range_date: Option<SystemTime>,
}

/// Description of the request body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEntity {
    pub media_type: Option<String>,
    pub encodings: Vec<String>,
    pub languages: Vec<String>,
    pub size: usize,
}

// REQUEST

/// Inbound HTTP request.
///
/// Built from one framed message. Everything beyond the request line is
/// derived on first access and memoized: each accessor parses its headers at
/// most once, however often it is called. A malformed header never fails the
/// request; it is logged and its facet reads as empty.
///
/// Setters replace a facet outright. A later accessor call returns the
/// replacement and never re-parses the headers over it.
///
/// The header collection itself has no setter and never changes once read.
#[derive(Debug)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    head: String,
    body: Vec<u8>,
    connection: Arc<ConnectionInfo>,
    table: FacetTable,

    headers: HeaderSet,
    host_domain: Option<String>,
    host_port: Option<u16>,
    original: Option<String>,
    reference: Option<String>,
    date: SystemTime,
    client: ClientInfo,
    conditions: Conditions,
    cookies: Vec<Cookie>,
    ranges: Vec<RangeSpec>,
    challenge: Option<ChallengeResponse>,
    proxy_challenge: Option<ChallengeResponse>,
    recipients: Vec<RecipientInfo>,
    warnings: Vec<Warning>,
    referrer: Option<String>,
    cache_directives: Vec<CacheDirective>,
    access_control_headers: Vec<String>,
    access_control_method: Option<Method>,
    entity: Option<RequestEntity>,
}

impl Request {
    pub(crate) fn new(frame: Frame, connection: Arc<ConnectionInfo>) -> Self {
        let client = ClientInfo::new(connection.remote);

        Request {
            method: frame.method,
            target: frame.target,
            version: frame.version,
            head: frame.head,
            body: frame.body,
            connection,
            table: FacetTable::new(),

            headers: HeaderSet::new(),
            host_domain: None,
            host_port: None,
            original: None,
            reference: None,
            date: SystemTime::UNIX_EPOCH,
            client,
            conditions: Conditions::default(),
            cookies: Vec::new(),
            ranges: Vec::new(),
            challenge: None,
            proxy_challenge: None,
            recipients: Vec::new(),
            warnings: Vec::new(),
            referrer: None,
            cache_directives: Vec::new(),
            access_control_headers: Vec::new(),
            access_control_method: None,
            entity: None,
        }
    }
}

// Request line and connection
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Request target exactly as sent, e.g. `/api/users?id=1`.
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Raw request body. Empty when the message had none.
    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Moves the body out, leaving it empty.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Peer address, read from the live connection.
    #[inline(always)]
    pub fn client_address(&self) -> IpAddr {
        self.connection.remote.ip()
    }

    /// Peer port, read from the live connection.
    #[inline(always)]
    pub fn client_port(&self) -> u16 {
        self.connection.remote.port()
    }

    #[inline(always)]
    pub fn connection(&self) -> &Arc<ConnectionInfo> {
        &self.connection
    }

    /// Closes the connection once the handler returns, without writing a response.
    pub fn abort(&self) {
        self.connection.abort();
    }

    pub fn facet_state(&self, facet: Facet) -> FacetState {
        self.table.states[facet as usize]
    }

    /// How many times `facet` has been computed from the headers (0 or 1).
    pub fn parse_count(&self, facet: Facet) -> u32 {
        self.table.parses[facet as usize]
    }
}

// Lazy facets
impl Request {
    /// Header lines in arrival order.
    pub fn headers(&mut self) -> &HeaderSet {
        self.ensure_headers();
        &self.headers
    }

    #[inline]
    fn ensure_headers(&mut self) {
        if self.table.begin(Facet::Headers) {
            self.headers = parse_head(&self.head);
        }
    }

    fn ensure_host(&mut self) {
        self.ensure_headers();
        if !self.table.begin(Facet::Host) {
            return;
        }

        match self.headers.get_first("Host") {
            Some(value) => match header::read_host(value) {
                Ok((domain, port)) => {
                    self.host_port = Some(port.unwrap_or(self.connection.protocol.default_port()));
                    self.host_domain = Some(domain);
                }
                Err(error) => tracing::info!(header = "Host", %error, "ignoring malformed header"),
            },
            None => tracing::info!(
                request_target = %self.target,
                "request has no Host header, host fields stay undefined"
            ),
        }
    }

    /// Domain part of the `Host` header. `[::1]` keeps its brackets.
    pub fn host_domain(&mut self) -> Option<&str> {
        self.ensure_host();
        self.host_domain.as_deref()
    }

    /// Port from the `Host` header, or the protocol's default port when the
    /// header names none.
    pub fn host_port(&mut self) -> Option<u16> {
        self.ensure_host();
        self.host_port
    }

    /// `scheme://domain[:port]`, with the port omitted when it is the default.
    ///
    /// Without a `Host` header the local address of the connection is used.
    pub fn host_ref(&mut self) -> String {
        self.ensure_host();

        let protocol = self.connection.protocol;
        let scheme = protocol.scheme_name();

        let (domain, port) = match &self.host_domain {
            Some(domain) => (domain.clone(), self.host_port),
            None => {
                let local = self.connection.local;
                let domain = match local.ip() {
                    IpAddr::V6(ip) => format!("[{ip}]"),
                    IpAddr::V4(ip) => ip.to_string(),
                };
                (domain, Some(local.port()))
            }
        };

        match port {
            Some(port) if port != protocol.default_port() => format!("{scheme}://{domain}:{port}"),
            _ => format!("{scheme}://{domain}"),
        }
    }

    /// Reference the request was received with, before any
    /// [`set_resource_ref`](Self::set_resource_ref).
    pub fn original_ref(&mut self) -> &str {
        if self.table.begin(Facet::OriginalReference) {
            let host_ref = self.host_ref();
            self.original = Some(resource_reference(&host_ref, &self.target));
        }

        self.original.as_deref().unwrap_or_default()
    }

    /// Absolute reference of the target resource.
    pub fn resource_ref(&mut self) -> &str {
        if self.table.begin(Facet::Reference) {
            self.reference = Some(self.original_ref().to_string());
        }

        self.reference.as_deref().unwrap_or_default()
    }

    /// Value of the `Date` header, or the time of the first call when the
    /// header is absent or invalid.
    pub fn date(&mut self) -> SystemTime {
        self.ensure_headers();
        if self.table.begin(Facet::Date) {
            self.date = match self.headers.get_first("Date") {
                Some(value) => header::read_date(value).unwrap_or_else(|| {
                    tracing::info!(header = "Date", value, "ignoring invalid date");
                    SystemTime::now()
                }),
                None => SystemTime::now(),
            };
        }

        self.date
    }

    /// Client address chain, agent and negotiation preferences.
    pub fn client_info(&mut self) -> &ClientInfo {
        self.ensure_headers();
        if self.table.begin(Facet::Client) {
            let headers = &self.headers;
            let client = &mut self.client;

            let lists: [(&'static str, &mut Vec<Preference>); 5] = [
                ("Accept", &mut client.accepted_media_types),
                ("Accept-Charset", &mut client.accepted_character_sets),
                ("Accept-Encoding", &mut client.accepted_encodings),
                ("Accept-Language", &mut client.accepted_languages),
                ("Accept-Patch", &mut client.accepted_patches),
            ];
            for (name, slot) in lists {
                if let Some(prefs) = read_joined(headers, name, header::read_preferences) {
                    *slot = prefs;
                }
            }
            if let Some(expectations) = read_joined(headers, "Expect", header::read_expectations) {
                client.expectations = expectations;
            }

            if self.connection.use_forwarded_for {
                for value in headers.values("X-Forwarded-For") {
                    client.forwarded_addresses.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|addr| !addr.is_empty())
                            .map(str::to_string),
                    );
                }
            }

            client.agent = headers.get_first("User-Agent").map(str::to_string);
            client.from = headers.get_first("From").map(str::to_string);
        }

        &self.client
    }

    pub fn conditions(&mut self) -> &Conditions {
        self.ensure_headers();
        if self.table.begin(Facet::Conditions) {
            let headers = &self.headers;
            let conditions = &mut self.conditions;

            if let Some(value) = headers.get_values("If-Match") {
                conditions.match_tags = read_tag_list("If-Match", &value);
            }
            if let Some(value) = headers.get_values("If-None-Match") {
                conditions.none_match_tags = read_tag_list("If-None-Match", &value);
            }
            conditions.modified_since = read_date_header(headers, "If-Modified-Since");
            conditions.unmodified_since = read_date_header(headers, "If-Unmodified-Since");

            if let Some(value) = headers.get_first("If-Range") {
                match Tag::parse(value) {
                    Ok(tag) => conditions.range_tag = Some(tag),
                    Err(_) => match header::read_date(value) {
                        Some(date) => conditions.range_date = Some(date),
                        None => tracing::info!(
                            header = "If-Range",
                            value,
                            "ignoring value that is neither a tag nor a date"
                        ),
                    },
                }
            }
        }

        &self.conditions
    }

    pub fn cookies(&mut self) -> &[Cookie] {
        self.ensure_headers();
        if self.table.begin(Facet::Cookies) {
            if let Some(cookies) = read_joined(&self.headers, "Cookie", header::read_cookies) {
                self.cookies = cookies;
            }
        }

        &self.cookies
    }

    pub fn ranges(&mut self) -> &[RangeSpec] {
        self.ensure_headers();
        if self.table.begin(Facet::Ranges) {
            if let Some(ranges) = read_first(&self.headers, "Range", header::read_ranges) {
                self.ranges = ranges;
            }
        }

        &self.ranges
    }

    /// Credentials from `Authorization`.
    pub fn challenge_response(&mut self) -> Option<&ChallengeResponse> {
        self.ensure_headers();
        if self.table.begin(Facet::Challenge) {
            self.challenge =
                read_first(&self.headers, "Authorization", header::read_challenge_response);
        }

        self.challenge.as_ref()
    }

    /// Credentials from `Proxy-Authorization`.
    pub fn proxy_challenge_response(&mut self) -> Option<&ChallengeResponse> {
        self.ensure_headers();
        if self.table.begin(Facet::ProxyChallenge) {
            self.proxy_challenge = read_first(
                &self.headers,
                "Proxy-Authorization",
                header::read_challenge_response,
            );
        }

        self.proxy_challenge.as_ref()
    }

    /// Intermediaries listed in `Via`, nearest last.
    pub fn recipients_info(&mut self) -> &[RecipientInfo] {
        self.ensure_headers();
        if self.table.begin(Facet::Recipients) {
            if let Some(recipients) = read_joined(&self.headers, "Via", header::read_via) {
                self.recipients = recipients;
            }
        }

        &self.recipients
    }

    pub fn warnings(&mut self) -> &[Warning] {
        self.ensure_headers();
        if self.table.begin(Facet::Warnings) {
            if let Some(warnings) = read_joined(&self.headers, "Warning", header::read_warnings) {
                self.warnings = warnings;
            }
        }

        &self.warnings
    }

    /// Value of the `Referer` header.
    pub fn referrer_ref(&mut self) -> Option<&str> {
        self.ensure_headers();
        if self.table.begin(Facet::Referrer) {
            self.referrer = self.headers.get_first("Referer").map(str::to_string);
        }

        self.referrer.as_deref()
    }

    /// `Cache-Control` request directives.
    pub fn cache_directives(&mut self) -> &[CacheDirective] {
        self.ensure_headers();
        if self.table.begin(Facet::CacheDirectives) {
            if let Some(value) = self.headers.get_values("Cache-Control") {
                self.cache_directives = header::read_cache_directives(&value);
            }
        }

        &self.cache_directives
    }

    pub fn access_control_request_headers(&mut self) -> &[String] {
        self.ensure_headers();
        if self.table.begin(Facet::AccessControlHeaders) {
            if let Some(value) = self.headers.get_values("Access-Control-Request-Headers") {
                self.access_control_headers = header::read_tokens(&value);
            }
        }

        &self.access_control_headers
    }

    pub fn access_control_request_method(&mut self) -> Option<Method> {
        self.ensure_headers();
        if self.table.begin(Facet::AccessControlMethod) {
            if let Some(value) = self.headers.get_first("Access-Control-Request-Method") {
                match value.parse::<Method>() {
                    Ok(method) => self.access_control_method = Some(method),
                    Err(()) => tracing::info!(
                        header = "Access-Control-Request-Method",
                        value,
                        "ignoring unsupported method"
                    ),
                }
            }
        }

        self.access_control_method
    }

    /// Description of the body, or `None` when the request carries no entity.
    pub fn entity(&mut self) -> Option<&RequestEntity> {
        self.ensure_headers();
        if self.table.begin(Facet::Entity) {
            let media_type = self.headers.get_first("Content-Type").map(str::to_string);

            if media_type.is_some() || !self.body.is_empty() {
                let list = |name| {
                    self.headers
                        .get_values(name)
                        .map(|v| header::read_tokens(&v))
                        .unwrap_or_default()
                };

                self.entity = Some(RequestEntity {
                    media_type,
                    encodings: list("Content-Encoding"),
                    languages: list("Content-Language"),
                    size: self.body.len(),
                });
            }
        }

        self.entity.as_ref()
    }
}

// Overrides
impl Request {
    pub fn set_client_info(&mut self, client: ClientInfo) {
        self.client = client;
        self.table.override_with(Facet::Client);
    }

    pub fn set_conditions(&mut self, conditions: Conditions) {
        self.conditions = conditions;
        self.table.override_with(Facet::Conditions);
    }

    pub fn set_cookies(&mut self, cookies: Vec<Cookie>) {
        self.cookies = cookies;
        self.table.override_with(Facet::Cookies);
    }

    pub fn set_ranges(&mut self, ranges: Vec<RangeSpec>) {
        self.ranges = ranges;
        self.table.override_with(Facet::Ranges);
    }

    pub fn set_challenge_response(&mut self, challenge: Option<ChallengeResponse>) {
        self.challenge = challenge;
        self.table.override_with(Facet::Challenge);
    }

    pub fn set_proxy_challenge_response(&mut self, challenge: Option<ChallengeResponse>) {
        self.proxy_challenge = challenge;
        self.table.override_with(Facet::ProxyChallenge);
    }

    pub fn set_recipients_info(&mut self, recipients: Vec<RecipientInfo>) {
        self.recipients = recipients;
        self.table.override_with(Facet::Recipients);
    }

    pub fn set_warnings(&mut self, warnings: Vec<Warning>) {
        self.warnings = warnings;
        self.table.override_with(Facet::Warnings);
    }

    pub fn set_referrer_ref(&mut self, referrer: Option<String>) {
        self.referrer = referrer;
        self.table.override_with(Facet::Referrer);
    }

    pub fn set_cache_directives(&mut self, directives: Vec<CacheDirective>) {
        self.cache_directives = directives;
        self.table.override_with(Facet::CacheDirectives);
    }

    /// Replaces the resource reference; [`original_ref`](Self::original_ref)
    /// keeps the received one.
    pub fn set_resource_ref(&mut self, reference: impl Into<String>) {
        self.reference = Some(reference.into());
        self.table.override_with(Facet::Reference);
    }
}

/// Joins a host reference and a request target with exactly one `/`.
///
/// Absolute targets are already complete and are returned unchanged.
pub(crate) fn resource_reference(host_ref: &str, target: &str) -> String {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return target.to_string();
    }

    let host_ref = host_ref.strip_suffix('/').unwrap_or(host_ref);
    let path = target.strip_prefix('/').unwrap_or(target);

    format!("{host_ref}/{path}")
}

fn parse_head(head: &str) -> HeaderSet {
    let mut headers = HeaderSet::with_capacity(head.matches("\r\n").count());

    for line in head.split("\r\n").filter(|line| !line.is_empty()) {
        match line.split_once(':') {
            Some((name, value)) => headers.add(name, value.trim()),
            None => tracing::info!(line, "skipping header line without a colon"),
        }
    }

    headers
}

#[inline]
fn logged<T>(name: &'static str, result: Result<T, HeaderError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::info!(header = name, %error, "ignoring malformed header");
            None
        }
    }
}

/// Reads every line named `name` as one comma-joined value.
fn read_joined<T>(
    headers: &HeaderSet,
    name: &'static str,
    read: fn(&str) -> Result<T, HeaderError>,
) -> Option<T> {
    let value = headers.get_values(name)?;
    logged(name, read(&value))
}

fn read_first<T>(
    headers: &HeaderSet,
    name: &'static str,
    read: fn(&str) -> Result<T, HeaderError>,
) -> Option<T> {
    let value = headers.get_first(name)?;
    logged(name, read(value))
}

fn read_date_header(headers: &HeaderSet, name: &'static str) -> Option<SystemTime> {
    let value = headers.get_first(name)?;
    let date = header::read_date(value);
    if date.is_none() {
        tracing::info!(header = name, value, "ignoring invalid date");
    }
    date
}

/// Tags before the first malformed one are kept.
fn read_tag_list(name: &'static str, value: &str) -> Option<Vec<Tag>> {
    let mut tags: Option<Vec<Tag>> = None;

    for element in header::split_list(value) {
        match Tag::parse(element) {
            Ok(tag) => tags.get_or_insert_with(Vec::new).push(tag),
            Err(error) => {
                tracing::info!(header = name, %error, "ignoring malformed header");
                break;
            }
        }
    }

    tags
}

#[cfg(test)]
impl Request {
    pub(crate) fn for_test(method: Method, target: &str, headers: &[(&str, &str)]) -> Self {
        Self::for_connection(method, target, headers, test_connection(false))
    }

    pub(crate) fn for_connection(
        method: Method,
        target: &str,
        headers: &[(&str, &str)],
        connection: Arc<ConnectionInfo>,
    ) -> Self {
        let head = headers
            .iter()
            .map(|(name, value)| format!("{name}: {value}\r\n"))
            .collect();

        Request::new(
            Frame {
                method,
                target: target.to_string(),
                version: Version::Http11,
                head,
                body: Vec::new(),
            },
            connection,
        )
    }
}

#[cfg(test)]
pub(crate) fn test_connection(use_forwarded_for: bool) -> Arc<ConnectionInfo> {
    Arc::new(ConnectionInfo::new(
        "10.0.0.7:51000".parse().unwrap(),
        "127.0.0.1:8080".parse().unwrap(),
        Protocol::Http,
        use_forwarded_for,
    ))
}
