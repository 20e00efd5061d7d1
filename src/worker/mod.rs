use std::net::IpAddr;
use std::time::SystemTime;

use httpdate::fmt_http_date;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::cache::ResponseCache;
use crate::events::EventLog;
use crate::http::{self, Method, Request, Response};
use crate::origin;
use crate::tunnel;
use crate::Error;

/// Shared proxy state: the response cache and the event log. One `handle`
/// call runs per accepted client connection, concurrently with others.
pub struct Proxy {
    cache: ResponseCache,
    events: EventLog,
}

/// Outcome of consulting the cache for a GET, decided before any origin
/// connection is opened. A fresh hit is served entirely from the cache.
enum Lookup {
    Miss,
    Fresh(Response),
    Revalidate(Response, Validator),
}

enum Validator {
    Etag(String),
    LastModified(String),
}

impl Proxy {
    pub fn new(cache_capacity: usize, events: EventLog) -> Proxy {
        Proxy {
            cache: ResponseCache::new(cache_capacity),
            events,
        }
    }

    /// Top-level error funnel: any failure below is logged as
    /// `<id>: ERROR <message>` and the sockets are closed. Errors never
    /// cross connections.
    pub async fn handle<S>(&self, client_id: u32, mut client: S, peer_ip: IpAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = self.serve(client_id, &mut client, peer_ip).await {
            self.events.append(&format!("{client_id}: ERROR {e}"));
        }
        let _ = client.shutdown().await;
    }

    async fn serve<S>(&self, id: u32, client: &mut S, peer_ip: IpAddr) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; http::BUFFER_SIZE];
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::InvalidRequest);
        }
        let request = Request::parse(&buf[..n], SystemTime::now())?;
        self.events.append(&format!(
            "{id}: {} from {peer_ip} @ {}",
            request.method,
            fmt_http_date(request.request_time)
        ));
        #[cfg(debug_assertions)]
        log::info!(method = request.method.as_str(), host = request.host.clone(), port = request.port; "client_request");
        match request.method {
            Method::Connect => self.handle_connect(id, client, &request).await,
            Method::Get => self.handle_get(id, client, &request).await,
            Method::Post => self.handle_post(id, client, &request).await,
            Method::Other(ref token) => Err(Error::UnsupportedMethod(token.clone())),
        }
    }

    async fn handle_connect<S>(&self, id: u32, client: &mut S, request: &Request) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut origin_stream = origin::connect(&request.host, request.port).await?;
        self.events.append(&format!(
            "{id}: Requesting {} from {}",
            request.start_line, request.raw_target
        ));
        tunnel::run(client, &mut origin_stream).await?;
        self.events.append(&format!("{id}: Tunnel closed"));
        Ok(())
    }

    async fn handle_post<S>(&self, id: u32, client: &mut S, request: &Request) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut origin_stream = origin::connect(&request.host, request.port).await?;
        self.events.append(&format!(
            "{id}: Requesting {} from {}",
            request.start_line, request.raw_target
        ));
        let response = self.fetch(client, &mut origin_stream, request).await?;
        self.finish(id, &request.method, &response);
        Ok(())
    }

    async fn handle_get<S>(&self, id: u32, client: &mut S, request: &Request) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.lookup(id, request.url()) {
            Lookup::Fresh(cached) => self.respond_cached(client, &cached).await,
            Lookup::Miss => {
                let mut origin_stream = origin::connect(&request.host, request.port).await?;
                self.events.append(&format!(
                    "{id}: Requesting {} from {}",
                    request.start_line, request.raw_target
                ));
                let response = self.fetch(client, &mut origin_stream, request).await?;
                self.finish(id, &Method::Get, &response);
                Ok(())
            }
            Lookup::Revalidate(cached, validator) => {
                let mut origin_stream = origin::connect(&request.host, request.port).await?;
                self.events.append(&format!(
                    "{id}: Requesting {} from {}",
                    request.start_line, request.raw_target
                ));
                self.revalidate(id, client, &mut origin_stream, request, &cached, validator)
                    .await
            }
        }
    }

    /// The per-GET cache decision. `get` promotes the entry, so a hit of
    /// any kind counts as a touch in LRU order.
    fn lookup(&self, id: u32, url: &str) -> Lookup {
        let Some(cached) = self.cache.get(url) else {
            self.events.append(&format!("{id}: not in cache"));
            return Lookup::Miss;
        };
        if cached.fresh_at(SystemTime::now()) {
            self.events.append(&format!("{id}: in cache, valid"));
            return Lookup::Fresh(cached);
        }
        if let Some(etag) = cached.etag.clone() {
            self.events.append(&format!("{id}: in cache, requires validation"));
            return Lookup::Revalidate(cached, Validator::Etag(etag));
        }
        if cached.last_modified.is_some() {
            if let Some(value) = cached.header_fields.get(http::LAST_MODIFIED).cloned() {
                self.events.append(&format!("{id}: in cache, requires validation"));
                return Lookup::Revalidate(cached, Validator::LastModified(value));
            }
        }
        self.events.append(&format!(
            "{id}: in cache, but expired at {}",
            fmt_http_date(cached.expires_at)
        ));
        Lookup::Miss
    }

    /// Plain forward fetch: send the request verbatim, relay the first
    /// stretch (header plus any early body bytes), then stream the rest.
    async fn fetch<S>(
        &self,
        client: &mut S,
        origin_stream: &mut TcpStream,
        request: &Request,
    ) -> Result<Response, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        origin::send_request(origin_stream, &request.raw_bytes).await?;
        let first = origin::read_header_block(origin_stream).await?;
        client.write_all(first.bytes()).await?;
        origin::stream_body(origin_stream, client, first, request.url()).await
    }

    /// Conditional refetch of a stale cached entry. A 304 confirms the
    /// entry and the cached bytes are replayed; anything else is forwarded
    /// end-to-end and re-parsed, replacing the entry under the same key.
    async fn revalidate<S>(
        &self,
        id: u32,
        client: &mut S,
        origin_stream: &mut TcpStream,
        request: &Request,
        cached: &Response,
        validator: Validator,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let section = match &validator {
            Validator::Etag(etag) => format!("\r\nIf-None-Match: {etag}"),
            Validator::LastModified(value) => format!("\r\nIf-Modified-Since: {value}"),
        };
        let conditional = http::insert_after_start_line(&request.raw_bytes, &section);
        origin::send_request(origin_stream, &conditional).await?;
        let first = origin::read_header_block(origin_stream).await?;
        let start_line = http::start_line_of(first.header())?;
        if http::status_code_of(&start_line)? == 304 {
            self.events.append(&format!(
                "{id}: Received {start_line} from {}",
                request.url()
            ));
            self.events.append(&format!("{id}: Responding {start_line}"));
            self.respond_cached(client, cached).await
        } else {
            client.write_all(first.bytes()).await?;
            let response =
                origin::stream_body(origin_stream, client, first, request.url()).await?;
            self.finish(id, &Method::Get, &response);
            Ok(())
        }
    }

    /// Replay a cached response: the stored header block followed by every
    /// body segment, byte for byte.
    async fn respond_cached<S>(&self, client: &mut S, cached: &Response) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        client.write_all(&cached.raw_header).await?;
        for segment in &cached.body_segments {
            client.write_all(segment).await?;
        }
        client.flush().await?;
        Ok(())
    }

    /// Post-fetch bookkeeping: response logs, cache population, and the
    /// cache-policy line for successful GETs.
    fn finish(&self, id: u32, method: &Method, response: &Response) {
        self.events.append(&format!(
            "{id}: Received {} from {}",
            response.start_line, response.url
        ));
        self.events
            .append(&format!("{id}: Responding {}", response.start_line));
        if *method == Method::Get && !response.no_store {
            self.cache.put(&response.url, response.clone());
        }
        if *method == Method::Get && response.status_code == 200 {
            let policy = if response.no_store {
                format!("{id}: not cachable because no-store")
            } else if response.etag.is_some() || response.last_modified.is_some() {
                format!("{id}: cached, but requires re-validation")
            } else {
                format!(
                    "{id}: cached, expires at {}",
                    fmt_http_date(response.expires_at)
                )
            };
            self.events.append(&policy);
        }
    }
}
