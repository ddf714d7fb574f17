//! The per-client proxy state machine.
//!
//! A tunnel terminates RFB 3.8 on the client side, speaks RFB 3.8 to exactly
//! one back-end at a time and translates between them, watching every
//! framebuffer-update rectangle closely enough to know its byte length and
//! to intervene where needed (desktop-name rewrites, Tight zlib resets,
//! synthetic rectangles). Greeter events may swap the live back-end
//! underneath the client without breaking the negotiated stream.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend::{AuthRequest, BackendConnection};
use crate::config::{Config, SecurityMode};
use crate::error::{Error, Result};
use crate::greeter::{GreeterConnection, GreeterEvent};
use crate::rfb::{
    client_msg, desktop_size_status, encoding, security, security_result, server_msg,
    tight_filter, vencrypt, PixelFormat, RectangleHeader, ServerInit, TightControl,
    SCREEN_SIZE, TIGHT_MIN_SIZE_TO_COMPRESS, TIGHT_PIXEL_SIZE, VERSION_STRING,
};
use crate::session::{Session, SessionRegistry};
use crate::stream::{ClientStream, Formatter};
use crate::tls::TlsProvider;

/// Serve one accepted client to completion. This is the worker's top-level
/// frame: errors are logged here and the connection is dropped.
pub async fn run_client(
    tcp: TcpStream,
    peer: std::net::SocketAddr,
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
    tls: Arc<TlsProvider>,
) {
    info!(%peer, "Accepted client");

    match serve(tcp, &registry, &config, &tls).await {
        Ok(()) => {}
        Err(e) if e.is_end_of_stream() => {}
        Err(e) => error!(%peer, error = %e, "Client connection failed"),
    }

    info!(%peer, "Disconnected client");
}

async fn serve(
    tcp: TcpStream,
    registry: &Arc<SessionRegistry>,
    config: &Arc<Config>,
    tls: &TlsProvider,
) -> Result<()> {
    let mut fmt = Formatter::new(ClientStream::Plain(tcp));

    match negotiate_security(&mut fmt, config).await? {
        SecurityOutcome::Ready => {}
        SecurityOutcome::StartTls { anonymous } => {
            let acceptor = if anonymous {
                tls.anonymous()
            } else {
                tls.certificate()
            }
            .ok_or_else(|| Error::Tls("selected TLS mode is not configured".to_string()))?
            .clone();

            let tcp = fmt.into_inner().into_plain()?;
            let tls_stream = acceptor
                .accept(tcp)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;
            fmt = Formatter::new(ClientStream::Tls(Box::new(tls_stream)));

            // The inner security over TLS is always None.
            fmt.send_u32(security_result::OK).await?;
        }
    }

    run_session(fmt, registry, config).await
}

/// How the stream continues after security negotiation.
pub enum SecurityOutcome {
    /// SecurityResult has been sent; continue on the same stream.
    Ready,
    /// Wrap the stream in a TLS server session, then send SecurityResult.
    StartTls { anonymous: bool },
}

/// Version exchange and security negotiation, server role.
pub async fn negotiate_security<S>(fmt: &mut Formatter<S>, config: &Config) -> Result<SecurityOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fmt.send_raw(VERSION_STRING).await?;

    let mut version = [0u8; 12];
    fmt.recv_exact(&mut version).await?;
    if &version != VERSION_STRING {
        fmt.send_u8(0).await?;
        send_reason(fmt, "Client version is not supported.").await?;
        return Err(Error::protocol("client requires an unsupported version"));
    }

    let security_types = offered_security_types(&config.security);
    fmt.send_u8(security_types.len() as u8).await?;
    fmt.send_raw(&security_types).await?;

    let chosen = fmt.recv_u8().await?;
    if !security_types.contains(&chosen) {
        fmt.send_u32(security_result::FAILED).await?;
        send_reason(fmt, "Client chose an invalid security type.").await?;
        return Err(Error::protocol("client chose an invalid security type"));
    }

    match chosen {
        security::NONE => {
            fmt.send_u32(security_result::OK).await?;
            Ok(SecurityOutcome::Ready)
        }
        security::VENCRYPT => negotiate_vencrypt(fmt, config).await,
        _ => unreachable!("only None and VeNCrypt are ever offered"),
    }
}

async fn negotiate_vencrypt<S>(fmt: &mut Formatter<S>, config: &Config) -> Result<SecurityOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Version 0.2, ours first.
    fmt.send_raw(&[0, 2]).await?;

    let major = fmt.recv_u8().await?;
    let minor = fmt.recv_u8().await?;

    // Status byte: zero accepts, anything else ends the conversation.
    let accepted = (major, minor) == (0, 2);
    fmt.send_u8(u8::from(!accepted)).await?;
    if !accepted {
        return Err(Error::protocol("unsupported VeNCrypt version"));
    }

    let subtypes: Vec<u32> = config
        .security
        .iter()
        .map(|mode| mode.vencrypt_subtype())
        .collect();
    fmt.send_u8(subtypes.len() as u8).await?;
    for subtype in &subtypes {
        fmt.send_u32(*subtype).await?;
    }

    let selected = fmt.recv_u32().await?;
    if !subtypes.contains(&selected) {
        let reason = "Client chose an invalid VeNCrypt security subtype.";
        fmt.send_u8(0).await?;
        fmt.send_u32(security_result::FAILED).await?;
        fmt.send_u32(reason.len() as u32).await?;
        fmt.send_raw(reason.as_bytes()).await?;
        return Err(Error::protocol(reason));
    }

    fmt.send_u8(1).await?;

    match selected {
        vencrypt::TLS_NONE => Ok(SecurityOutcome::StartTls { anonymous: true }),
        vencrypt::X509_NONE => Ok(SecurityOutcome::StartTls { anonymous: false }),
        vencrypt::NONE => {
            fmt.send_u32(security_result::OK).await?;
            Ok(SecurityOutcome::Ready)
        }
        _ => unreachable!("only configured subtypes are accepted"),
    }
}

/// Map the configured VeNCrypt subtypes to the outer security-type list.
/// VeNCrypt appears at most once, at the position of its first underlying
/// subtype, so client priority is preserved.
fn offered_security_types(modes: &[SecurityMode]) -> Vec<u8> {
    let mut types = Vec::new();
    let mut vencrypt_included = false;

    for mode in modes {
        match mode {
            SecurityMode::None => types.push(security::NONE),
            SecurityMode::Tls | SecurityMode::X509 => {
                if !vencrypt_included {
                    types.push(security::VENCRYPT);
                    vencrypt_included = true;
                }
            }
        }
    }

    types
}

async fn send_reason<S>(fmt: &mut Formatter<S>, reason: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fmt.send_u32(reason.len() as u32).await?;
    fmt.send_raw(reason.as_bytes()).await
}

/// After security: open a session and a back-end connection, finish the
/// RFB initialization and run the forwarding loop.
async fn run_session<C>(
    mut client: Formatter<C>,
    registry: &Arc<SessionRegistry>,
    config: &Arc<Config>,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let show_greeter = !config.disable_manager
        && (config.always_show_greeter || registry.has_visible_sessions());

    // Without the manager every connection gets a plain local session; with
    // it, a greeterless connection goes straight to the display manager.
    let query_display_manager = !config.disable_manager && !show_greeter;

    let session = registry.create_session(query_display_manager, config).await?;

    let greeter = if show_greeter {
        Some(GreeterConnection::spawn(
            config,
            session.display(),
            session.xauth_path(),
        )?)
    } else {
        None
    };

    let mut current = BackendConnection::open(session).await?;
    current.initialize().await?;

    let pixel_format = current.pixel_format();

    // ClientInit: the shared flag is consumed but not acted upon.
    let _shared = client.recv_u8().await?;

    let name = current.desktop_name();
    let init = ServerInit {
        width: current.framebuffer_width(),
        height: current.framebuffer_height(),
        pixel_format,
        name_length: name.len() as u32,
    };
    client.send_raw(&init.to_bytes()).await?;
    client.send_raw(name.as_bytes()).await?;

    let mut tunnel = Tunnel {
        client,
        current,
        greeter,
        switch: None,
        awaiting_password: None,
        awaiting_credentials: None,
        registry: registry.clone(),
        config: config.clone(),
        pixel_format,
        client_encodings: HashSet::new(),
        server_encodings: Vec::new(),
        tight_encoding_disabled: show_greeter,
        tight_zlib_reset_queued: false,
        desktop_name_change_queued: false,
    };

    tunnel.run().await
}

/// A back-end switch in flight: the task initializing the potential
/// connection plus the channel it asks for authentication material on.
struct SwitchInFlight {
    handle: JoinHandle<Result<BackendConnection>>,
    auth_requests: mpsc::Receiver<AuthRequest>,
}

impl Drop for SwitchInFlight {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

enum Wake {
    Client,
    Server,
    Greeter(GreeterEvent),
    Auth(AuthRequest),
    Switched(Result<BackendConnection>),
}

struct Tunnel<C> {
    client: Formatter<C>,
    current: BackendConnection,
    greeter: Option<GreeterConnection>,
    switch: Option<SwitchInFlight>,
    awaiting_password: Option<oneshot::Sender<String>>,
    awaiting_credentials: Option<oneshot::Sender<(String, String)>>,
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
    pixel_format: PixelFormat,
    /// Everything the client advertised that we know about.
    client_encodings: HashSet<i32>,
    /// What we ask the back-end to send, in the client's priority order.
    server_encodings: Vec<i32>,
    tight_encoding_disabled: bool,
    tight_zlib_reset_queued: bool,
    desktop_name_change_queued: bool,
}

impl<C: AsyncRead + AsyncWrite + Unpin> Tunnel<C> {
    async fn run(&mut self) -> Result<()> {
        loop {
            if let Some(greeter) = &mut self.greeter {
                greeter.update(&self.registry).await?;
            }

            let wake = {
                let Tunnel {
                    client,
                    current,
                    greeter,
                    switch,
                    ..
                } = self;

                let (auth_requests, switch_handle) = match switch {
                    Some(switch) => (Some(&mut switch.auth_requests), Some(&mut switch.handle)),
                    None => (None, None),
                };

                tokio::select! {
                    r = client.peek() => {
                        r?;
                        Wake::Client
                    }
                    r = current.peek() => {
                        r?;
                        Wake::Server
                    }
                    event = next_greeter_event(greeter.as_mut()) => Wake::Greeter(event?),
                    request = next_auth_request(auth_requests) => Wake::Auth(request),
                    result = switch_result(switch_handle) => Wake::Switched(result),
                }
            };

            match wake {
                Wake::Client => self.client_receive().await?,
                Wake::Server => self.server_receive().await?,
                Wake::Greeter(event) => self.handle_greeter_event(event).await?,
                Wake::Auth(request) => self.handle_auth_request(request).await?,
                Wake::Switched(result) => self.handle_switch_result(result).await?,
            }
        }
    }

    // --- client to server ------------------------------------------------

    async fn client_receive(&mut self) -> Result<()> {
        let message_type = self.client.recv_u8().await?;
        self.client.push_back(message_type)?;

        match message_type {
            client_msg::SET_PIXEL_FORMAT => self.process_set_pixel_format().await,
            client_msg::SET_ENCODINGS => self.process_set_encodings().await,
            client_msg::FRAMEBUFFER_UPDATE_REQUEST => self.forward_client_bytes(10).await,
            client_msg::KEY_EVENT => self.forward_client_bytes(8).await,
            client_msg::POINTER_EVENT => self.forward_client_bytes(6).await,
            client_msg::CLIENT_CUT_TEXT => self.process_client_cut_text().await,
            client_msg::SET_DESKTOP_SIZE => self.process_set_desktop_size().await,
            _ => Err(Error::protocol(
                "received unknown message type from the client",
            )),
        }
    }

    async fn forward_client_bytes(&mut self, len: usize) -> Result<()> {
        self.client
            .forward_directly(self.current.formatter(), len)
            .await
    }

    async fn process_set_pixel_format(&mut self) -> Result<()> {
        let mut message = [0u8; 20];
        self.client.recv_exact(&mut message).await?;

        let mut pf_bytes = [0u8; 16];
        pf_bytes.copy_from_slice(&message[4..20]);
        let pixel_format = PixelFormat::from_bytes(&pf_bytes);

        if !pixel_format.valid() {
            return Err(Error::protocol(
                "received invalid pixel format from the client",
            ));
        }

        self.pixel_format = pixel_format;
        self.current.send_set_pixel_format(&pixel_format).await
    }

    async fn process_set_encodings(&mut self) -> Result<()> {
        let _type = self.client.recv_u8().await?;
        let _padding = self.client.recv_u8().await?;
        let count = self.client.recv_u16().await?;

        let mut encodings = Vec::with_capacity(count as usize);
        for _ in 0..count {
            encodings.push(self.client.recv_i32().await?);
        }

        // Filter down to the encodings we can carry.
        self.client_encodings.clear();
        self.server_encodings.clear();
        for value in encodings {
            match value {
                encoding::RAW
                | encoding::COPY_RECT
                | encoding::RRE
                | encoding::DESKTOP_SIZE
                | encoding::LAST_RECT
                | encoding::CURSOR
                | encoding::XCURSOR
                | encoding::DESKTOP_NAME
                | encoding::EXTENDED_DESKTOP_SIZE => {
                    self.client_encodings.insert(value);
                    self.server_encodings.push(value);
                }
                encoding::TIGHT => {
                    self.client_encodings.insert(value);
                    if !self.tight_encoding_disabled {
                        self.server_encodings.push(value);
                    }
                }
                value
                    if (encoding::JPEG_QUALITY_LOWEST..=encoding::JPEG_QUALITY_HIGHEST)
                        .contains(&value) =>
                {
                    self.client_encodings.insert(value);
                    self.server_encodings.push(value);
                }
                _ => {}
            }
        }

        if !self.client_supports(encoding::DESKTOP_NAME) {
            // We always want desktop-name updates from the back-end.
            self.server_encodings.push(encoding::DESKTOP_NAME);
        }

        self.current.send_set_encodings(&self.server_encodings).await
    }

    async fn process_client_cut_text(&mut self) -> Result<()> {
        let mut header = [0u8; 8];
        self.client.recv_exact(&mut header).await?;
        let length = u32::from_be_bytes(header[4..8].try_into().unwrap());

        self.current.formatter().send_raw(&header).await?;
        self.client
            .forward_directly(self.current.formatter(), length as usize)
            .await
    }

    async fn process_set_desktop_size(&mut self) -> Result<()> {
        let mut header = [0u8; 8];
        self.client.recv_exact(&mut header).await?;
        let number_of_screens = header[6] as usize;

        self.current.formatter().send_raw(&header).await?;
        self.client
            .forward_directly(self.current.formatter(), number_of_screens * SCREEN_SIZE)
            .await
    }

    // --- server to client ------------------------------------------------

    async fn server_receive(&mut self) -> Result<()> {
        let message_type = self.current.formatter().recv_u8().await?;

        match message_type {
            server_msg::FRAMEBUFFER_UPDATE => self.process_framebuffer_update().await,
            server_msg::SET_COLOUR_MAP_ENTRIES => {
                self.process_set_colour_map_entries().await?;
                Err(Error::protocol("SetColourMapEntries is not implemented"))
            }
            server_msg::BELL => self.client.send_u8(server_msg::BELL).await,
            server_msg::SERVER_CUT_TEXT => self.process_server_cut_text().await,
            _ => Err(Error::protocol(
                "received unknown message type from the back-end",
            )),
        }
    }

    async fn process_framebuffer_update(&mut self) -> Result<()> {
        let supports_last_rect = self.client_supports(encoding::LAST_RECT);
        let mut must_use_last_rect = false;

        let padding = self.current.formatter().recv_u8().await?;
        let real_count = self.current.formatter().recv_u16().await?;

        let extra = self.count_extra_rectangles();
        let advertised = if u32::from(real_count) + u32::from(extra) > u32::from(u16::MAX) {
            if !supports_last_rect {
                return Err(Error::protocol(
                    "client does not support LastRect and the back-end sent too many rectangles",
                ));
            }
            must_use_last_rect = true;
            u16::MAX
        } else {
            real_count + extra
        };

        self.client
            .send_raw(&[server_msg::FRAMEBUFFER_UPDATE, padding])
            .await?;
        self.client.send_u16(advertised).await?;

        self.send_extra_rectangles().await?;

        let mut last_rect_received = false;
        for _ in 0..real_count {
            if last_rect_received {
                break;
            }

            let mut header = [0u8; RectangleHeader::WIRE_SIZE];
            self.current.formatter().recv_exact(&mut header).await?;
            let rectangle = RectangleHeader::from_bytes(&header);

            match rectangle.encoding {
                encoding::RAW | encoding::COPY_RECT | encoding::CURSOR | encoding::XCURSOR => {
                    let bpp = self.pixel_format.bits_per_pixel as usize;
                    let width = rectangle.width as usize;
                    let height = rectangle.height as usize;

                    let payload = match rectangle.encoding {
                        encoding::RAW => width * height * bpp / 8,
                        encoding::COPY_RECT => 4,
                        encoding::CURSOR => {
                            width * height * bpp / 8 + (width + 7) / 8 * height
                        }
                        encoding::XCURSOR => 6 + (width + 7) / 8 * height * 2,
                        _ => unreachable!(),
                    };

                    self.client.send_raw(&header).await?;
                    self.current
                        .formatter()
                        .forward_directly(&mut self.client, payload)
                        .await?;
                }

                encoding::RRE => {
                    self.client.send_raw(&header).await?;
                    let subrectangles = self
                        .current
                        .formatter()
                        .forward_u32(&mut self.client)
                        .await?;
                    let bytes_per_pixel = self.pixel_format.bytes_per_pixel();
                    let payload =
                        bytes_per_pixel + subrectangles as usize * (bytes_per_pixel + 8);
                    self.current
                        .formatter()
                        .forward_directly(&mut self.client, payload)
                        .await?;
                }

                encoding::DESKTOP_SIZE => {
                    self.client.send_raw(&header).await?;
                    self.current
                        .set_framebuffer_size(rectangle.width, rectangle.height);
                }

                encoding::LAST_RECT => {
                    self.client.send_raw(&header).await?;
                    last_rect_received = true;
                }

                encoding::DESKTOP_NAME => {
                    let length = self.current.formatter().recv_u32().await?;
                    let name = self
                        .current
                        .formatter()
                        .recv_string(length as usize)
                        .await?;
                    self.current.set_desktop_name(&name);

                    if self.client_supports(encoding::DESKTOP_NAME) {
                        // The announced name may differ from what the
                        // back-end just said; the session decides.
                        let name = self.current.desktop_name();
                        self.client.send_raw(&header).await?;
                        self.client.send_u32(name.len() as u32).await?;
                        self.client.send_raw(name.as_bytes()).await?;
                    } else if supports_last_rect {
                        must_use_last_rect = true;
                    } else {
                        // The client already expects a specific number of
                        // rectangles, so something has to fill the slot.
                        self.send_dummy_rectangle().await?;
                    }
                }

                encoding::EXTENDED_DESKTOP_SIZE => {
                    if rectangle.y == desktop_size_status::NO_ERROR {
                        self.current
                            .set_framebuffer_size(rectangle.width, rectangle.height);
                    }

                    self.client.send_raw(&header).await?;
                    let number_of_screens = self
                        .current
                        .formatter()
                        .forward_u8(&mut self.client)
                        .await? as usize;
                    self.current
                        .formatter()
                        .forward_directly(&mut self.client, 3)
                        .await?;
                    self.current
                        .formatter()
                        .forward_directly(&mut self.client, number_of_screens * SCREEN_SIZE)
                        .await?;
                }

                encoding::TIGHT => {
                    self.client.send_raw(&header).await?;
                    self.process_tight_rectangle(&rectangle).await?;
                }

                _ => {
                    return Err(Error::protocol(
                        "received unknown encoding from the back-end",
                    ))
                }
            }
        }

        if supports_last_rect {
            // If rectangles were dropped or added and the update did not end
            // with LastRect, close it out ourselves.
            if must_use_last_rect && !last_rect_received {
                self.send_last_rectangle().await?;
            }
        } else {
            debug_assert!(!must_use_last_rect);
        }

        Ok(())
    }

    /// The Tight sub-protocol: the only variable-length, internally
    /// structured encoding that has to be parsed to be forwarded.
    async fn process_tight_rectangle(&mut self, rectangle: &RectangleHeader) -> Result<()> {
        let mut control = TightControl(self.current.formatter().recv_u8().await?);

        if self.tight_zlib_reset_queued {
            self.tight_zlib_reset_queued = false;
            control.set_reset_all_streams();
        }

        self.client.send_u8(control.0).await?;

        if control.is_fill() {
            self.current
                .formatter()
                .forward_directly(&mut self.client, TIGHT_PIXEL_SIZE)
                .await?;
        } else if control.is_jpeg() {
            self.forward_tight_compact_data().await?;
        } else {
            // Basic compression.
            let mut filter = tight_filter::COPY;
            if control.has_filter_id() {
                filter = self
                    .current
                    .formatter()
                    .forward_u8(&mut self.client)
                    .await?;
            }

            let mut bpp = self.pixel_format.bits_per_pixel as usize;

            if filter == tight_filter::PALETTE {
                let palette_length = self
                    .current
                    .formatter()
                    .forward_u8(&mut self.client)
                    .await? as usize
                    + 1;

                self.current
                    .formatter()
                    .forward_directly(&mut self.client, TIGHT_PIXEL_SIZE * palette_length)
                    .await?;

                bpp = if palette_length <= 2 { 1 } else { 8 };
            }

            let data_size =
                (rectangle.width as usize * bpp + 7) / 8 * rectangle.height as usize;
            if data_size < TIGHT_MIN_SIZE_TO_COMPRESS {
                self.current
                    .formatter()
                    .forward_directly(&mut self.client, data_size)
                    .await?;
            } else {
                self.forward_tight_compact_data().await?;
            }
        }

        Ok(())
    }

    /// Forward a compact length (7 bits per byte, up to three bytes) and
    /// then that many bytes.
    async fn forward_tight_compact_data(&mut self) -> Result<()> {
        let mut length: usize = 0;

        let byte = self
            .current
            .formatter()
            .forward_u8(&mut self.client)
            .await?;
        length += (byte & 0x7f) as usize;

        if byte & 0x80 != 0 {
            let byte = self
                .current
                .formatter()
                .forward_u8(&mut self.client)
                .await?;
            length += ((byte & 0x7f) as usize) << 7;

            if byte & 0x80 != 0 {
                let byte = self
                    .current
                    .formatter()
                    .forward_u8(&mut self.client)
                    .await?;
                length += (byte as usize) << 14;
            }
        }

        self.current
            .formatter()
            .forward_directly(&mut self.client, length)
            .await
    }

    async fn process_set_colour_map_entries(&mut self) -> Result<()> {
        let padding = self.current.formatter().recv_u8().await?;
        let first_colour = self.current.formatter().recv_u16().await?;
        let number_of_colours = self.current.formatter().recv_u16().await?;

        let mut header = [0u8; 6];
        header[0] = server_msg::SET_COLOUR_MAP_ENTRIES;
        header[1] = padding;
        header[2..4].copy_from_slice(&first_colour.to_be_bytes());
        header[4..6].copy_from_slice(&number_of_colours.to_be_bytes());
        self.client.send_raw(&header).await?;

        self.current
            .formatter()
            .forward_directly(&mut self.client, number_of_colours as usize * 6)
            .await
    }

    async fn process_server_cut_text(&mut self) -> Result<()> {
        let mut rest = [0u8; 7];
        self.current.formatter().recv_exact(&mut rest).await?;
        let length = u32::from_be_bytes(rest[3..7].try_into().unwrap());

        self.client.send_u8(server_msg::SERVER_CUT_TEXT).await?;
        self.client.send_raw(&rest).await?;
        self.current
            .formatter()
            .forward_directly(&mut self.client, length as usize)
            .await
    }

    // --- synthetic rectangles --------------------------------------------

    fn count_extra_rectangles(&self) -> u16 {
        u16::from(self.desktop_name_change_queued)
    }

    async fn send_extra_rectangles(&mut self) -> Result<()> {
        if self.desktop_name_change_queued {
            self.desktop_name_change_queued = false;

            let rectangle = RectangleHeader::new(0, 0, 0, 0, encoding::DESKTOP_NAME);
            let name = self.current.desktop_name();

            self.client.send_raw(&rectangle.to_bytes()).await?;
            self.client.send_u32(name.len() as u32).await?;
            self.client.send_raw(name.as_bytes()).await?;
        }

        Ok(())
    }

    /// A suppressed rectangle still occupies a slot the client counted on;
    /// fill it with a harmless one-pixel update.
    async fn send_dummy_rectangle(&mut self) -> Result<()> {
        if self.client_supports(encoding::RAW) {
            // Blacken the top-left pixel.
            let rectangle = RectangleHeader::new(0, 0, 1, 1, encoding::RAW);
            self.client.send_raw(&rectangle.to_bytes()).await?;

            let black = [0u8; 4];
            self.client
                .send_raw(&black[..self.pixel_format.bytes_per_pixel()])
                .await
        } else if self.client_supports(encoding::COPY_RECT) {
            // Copy the neighbouring pixel over the top-left one.
            let rectangle = RectangleHeader::new(0, 0, 1, 1, encoding::COPY_RECT);
            self.client.send_raw(&rectangle.to_bytes()).await?;
            self.client.send_u16(1).await?;
            self.client.send_u16(0).await
        } else {
            Err(Error::protocol(
                "needed to send a dummy rectangle, but the client supports no suitable encoding",
            ))
        }
    }

    async fn send_last_rectangle(&mut self) -> Result<()> {
        let rectangle = RectangleHeader::new(0, 0, 0, 0, encoding::LAST_RECT);
        self.client.send_raw(&rectangle.to_bytes()).await
    }

    // --- greeter and switching -------------------------------------------

    async fn handle_greeter_event(&mut self, event: GreeterEvent) -> Result<()> {
        match event {
            GreeterEvent::NewSession => {
                let session = self.registry.create_session(true, &self.config).await?;
                self.switch_to(session);
            }
            GreeterEvent::OpenSession(id) => match self.registry.get_session(id) {
                Some(session) => self.switch_to(session),
                None => {
                    if let Some(greeter) = &mut self.greeter {
                        greeter.show_error("No such session.").await?;
                    }
                }
            },
            GreeterEvent::Password(password) => {
                if let Some(reply) = self.awaiting_password.take() {
                    let _ = reply.send(password);
                }
            }
            GreeterEvent::Credentials(username, password) => {
                if let Some(reply) = self.awaiting_credentials.take() {
                    let _ = reply.send((username, password));
                }
            }
            GreeterEvent::Ignored => {}
        }

        Ok(())
    }

    /// Begin switching to the given session. The potential connection
    /// initializes in its own task; its failure never unwinds the tunnel.
    fn switch_to(&mut self, session: Arc<Session>) {
        if self.tight_encoding_disabled {
            // Re-enable Tight for the next back-end; switching zlib streams
            // mid-connection was the reason to hold it back.
            self.tight_encoding_disabled = false;
            if self.client_supports(encoding::TIGHT) {
                self.server_encodings.insert(0, encoding::TIGHT);
            }
        }

        // A stale switch attempt is abandoned outright.
        self.switch = None;
        self.awaiting_password = None;
        self.awaiting_credentials = None;

        let (auth_tx, auth_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            let mut connection = BackendConnection::open(session).await?;
            connection.initialize_interactive(auth_tx).await?;
            Ok::<_, Error>(connection)
        });

        self.switch = Some(SwitchInFlight {
            handle,
            auth_requests: auth_rx,
        });
    }

    async fn handle_auth_request(&mut self, request: AuthRequest) -> Result<()> {
        let greeter = self
            .greeter
            .as_mut()
            .ok_or_else(|| Error::protocol("authentication requested without a greeter"))?;

        match request {
            AuthRequest::Password(reply) => {
                greeter.ask_for_password().await?;
                self.awaiting_password = Some(reply);
            }
            AuthRequest::Credentials(reply) => {
                greeter.ask_for_credentials().await?;
                self.awaiting_credentials = Some(reply);
            }
        }

        Ok(())
    }

    async fn handle_switch_result(&mut self, result: Result<BackendConnection>) -> Result<()> {
        self.switch = None;

        match result {
            Ok(connection) => self.connection_switched(connection).await,
            Err(e) => {
                warn!(error = %e, "Failed to switch back-end connection");
                if let Some(greeter) = &mut self.greeter {
                    greeter.show_error(&e.to_string()).await?;
                }
                Ok(())
            }
        }
    }

    /// Promote the freshly initialized connection to current and line up
    /// the stream for the client: pixel format, encodings, a full update,
    /// queued Tight resets and the pending desktop-name change.
    async fn connection_switched(&mut self, connection: BackendConnection) -> Result<()> {
        self.greeter = None;

        let old = std::mem::replace(&mut self.current, connection);
        drop(old);

        if self.current.pixel_format() != self.pixel_format {
            self.current.send_set_pixel_format(&self.pixel_format).await?;
        }

        self.current.send_set_encodings(&self.server_encodings).await?;

        // The response may surprise a client that has no pending request;
        // the alternative would be to withhold the new framebuffer
        // indefinitely.
        self.current.send_full_update_request().await?;

        self.tight_zlib_reset_queued = true;

        if self.client_supports(encoding::DESKTOP_NAME) {
            self.desktop_name_change_queued = true;
        }

        Ok(())
    }

    fn client_supports(&self, encoding: i32) -> bool {
        self.client_encodings.contains(&encoding)
    }
}

async fn next_greeter_event(greeter: Option<&mut GreeterConnection>) -> Result<GreeterEvent> {
    match greeter {
        Some(greeter) => greeter.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_auth_request(requests: Option<&mut mpsc::Receiver<AuthRequest>>) -> AuthRequest {
    match requests {
        Some(requests) => match requests.recv().await {
            Some(request) => request,
            // The sender is gone; the join handle will resolve instead.
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn switch_result(
    handle: Option<&mut JoinHandle<Result<BackendConnection>>>,
) -> Result<BackendConnection> {
    match handle {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(_) => Err(Error::protocol("switch task failed")),
        },
        None => std::future::pending().await,
    }
}
