//! 证书加密的 socket 通道
//!
//! 主机侧发起的控制会话走该通道。证书材料在启动时一次性装载并
//! 校验（链、有效期、私钥配对），任一校验失败都是启动期致命错误，
//! 而不是按连接报错。每个被接受的连接先完成 TLS 握手，握手失败
//! 直接关闭连接，不进入分发。
//!
//! 明文模式（[`ListenerMode::Plaintext`]）仅用于测试，生产部署
//! 必须走 TLS。

use crate::{CertError, ChannelError, ChannelKind, ControlSession};
use devc_protocol::{Packet, ProtocolError, read_packet, write_packet};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// TLS 握手的读超时
///
/// 握手阶段对端停滞超过该时间即放弃该连接，避免 accept 路径
/// 被恶意半开连接拖住。
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 证书材料文件路径
#[derive(Debug, Clone)]
pub struct CertPaths {
    /// CA 证书（PEM）
    pub ca: PathBuf,
    /// 服务端证书链（PEM）
    pub cert: PathBuf,
    /// 服务端私钥（PEM，未加密的 PKCS#8/RSA/SEC1）
    pub key: PathBuf,
    /// 私钥口令（仅接口兼容保留；加密私钥不受支持）
    pub key_password: Option<String>,
    /// 证书应匹配的服务名（链校验时使用）
    pub server_name: String,
}

/// TLS 服务端配置装载器
pub struct TlsServerConfig;

impl TlsServerConfig {
    /// 装载并校验证书材料，构建 rustls 服务端配置
    ///
    /// 校验顺序：文件可读 → PEM 可解析 → 证书链能通过 CA 验证且
    /// 在有效期内（过期/未生效给出独立错误）→ 私钥与证书配对。
    pub fn load(paths: &CertPaths) -> Result<Arc<ServerConfig>, ChannelError> {
        let ca_certs = load_pem_certs(&paths.ca)?;
        if ca_certs.is_empty() {
            return Err(CertError::MissingCert(paths.ca.clone()).into());
        }
        let chain = load_pem_certs(&paths.cert)?;
        if chain.is_empty() {
            return Err(CertError::MissingCert(paths.cert.clone()).into());
        }
        let key = load_private_key(&paths.key, paths.key_password.as_deref())?;

        verify_chain(&ca_certs, &chain, &paths.server_name)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| CertError::KeyMismatch(e.to_string()))?;

        debug!(server_name = %paths.server_name, "TLS server config loaded");
        Ok(Arc::new(config))
    }
}

fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let data = fs::read(path).map_err(|e| CertError::Unreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = io::BufReader::new(&data[..]);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })
}

fn load_private_key(
    path: &Path,
    password: Option<&str>,
) -> Result<PrivateKeyDer<'static>, CertError> {
    let data = fs::read(path).map_err(|e| CertError::Unreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    // rustls-pemfile 不解密私钥；加密 PEM 一律拒绝
    if data.windows(b"ENCRYPTED".len()).any(|w| w == b"ENCRYPTED") {
        return Err(CertError::EncryptedKey(path.to_path_buf()));
    }
    if password.is_some() {
        warn!("key password supplied but the private key is unencrypted, ignoring");
    }
    let mut reader = io::BufReader::new(&data[..]);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?
        .ok_or_else(|| CertError::MissingKey(path.to_path_buf()))
}

/// 用 CA 验证服务端证书链与有效期
fn verify_chain(
    ca_certs: &[CertificateDer<'static>],
    chain: &[CertificateDer<'static>],
    server_name: &str,
) -> Result<(), CertError> {
    let mut roots = RootCertStore::empty();
    for ca in ca_certs {
        roots
            .add(ca.clone())
            .map_err(|e| CertError::ChainInvalid(e.to_string()))?;
    }
    let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| CertError::ChainInvalid(e.to_string()))?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| CertError::BadServerName(server_name.to_string()))?;

    match verifier.verify_server_cert(&chain[0], &chain[1..], &name, &[], UnixTime::now()) {
        Ok(_) => Ok(()),
        Err(rustls::Error::InvalidCertificate(
            CertificateError::Expired | CertificateError::ExpiredContext { .. },
        )) => Err(CertError::Expired),
        Err(rustls::Error::InvalidCertificate(
            CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. },
        )) => Err(CertError::NotYetValid),
        Err(e) => Err(CertError::ChainInvalid(e.to_string())),
    }
}

/// 监听模式
#[derive(Clone)]
pub enum ListenerMode {
    /// 生产模式：每个连接在分发前完成 TLS 握手
    Tls(Arc<ServerConfig>),
    /// 明文模式，仅用于测试
    Plaintext,
}

impl std::fmt::Debug for ListenerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerMode::Tls(_) => write!(f, "Tls"),
            ListenerMode::Plaintext => write!(f, "Plaintext"),
        }
    }
}

/// socket 通道监听器
///
/// accept 为非阻塞；accept 循环在专用线程上轮询，配合关停标志
/// 可以随时退出，不会阻塞已接受会话的请求处理。
pub struct SocketListener {
    listener: TcpListener,
    mode: ListenerMode,
}

impl SocketListener {
    /// 绑定监听地址
    pub fn bind<A: ToSocketAddrs>(addr: A, mode: ListenerMode) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, mode })
    }

    /// 实际监听地址
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    /// 尝试接受一个连接并完成安全会话升级
    ///
    /// `Ok(None)` 表示当前没有待接受的连接。握手失败返回 `Err`，
    /// 调用方记录日志后继续 accept，连接已被丢弃。
    pub fn accept(&self) -> Result<Option<SocketSession>, ChannelError> {
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        stream.set_nonblocking(false)?;
        let _ = stream.set_nodelay(true);

        let stream = match &self.mode {
            ListenerMode::Tls(config) => {
                stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                let mut tcp = stream;
                let mut conn = ServerConnection::new(Arc::clone(config))?;
                while conn.is_handshaking() {
                    conn.complete_io(&mut tcp)?;
                }
                debug!(%peer, "TLS handshake complete");
                SocketStream::Tls(StreamOwned::new(conn, tcp))
            },
            ListenerMode::Plaintext => SocketStream::Plain(stream),
        };

        Ok(Some(SocketSession {
            stream,
            peer,
            read_timeout: None,
        }))
    }
}

enum SocketStream {
    Tls(StreamOwned<ServerConnection, TcpStream>),
    Plain(TcpStream),
}

impl SocketStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            SocketStream::Tls(s) => s.get_ref(),
            SocketStream::Plain(s) => s,
        }
    }
}

impl Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SocketStream::Tls(s) => s.read(buf),
            SocketStream::Plain(s) => s.read(buf),
        }
    }
}

impl Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SocketStream::Tls(s) => s.write(buf),
            SocketStream::Plain(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SocketStream::Tls(s) => s.flush(),
            SocketStream::Plain(s) => s.flush(),
        }
    }
}

/// 一个已升级的 socket 会话
pub struct SocketSession {
    stream: SocketStream,
    peer: SocketAddr,
    read_timeout: Option<Duration>,
}

impl SocketSession {
    fn apply_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if self.read_timeout != Some(timeout) {
            self.stream.tcp().set_read_timeout(Some(timeout))?;
            self.read_timeout = Some(timeout);
        }
        Ok(())
    }
}

fn map_read_error(e: io::Error) -> ChannelError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => ChannelError::Closed,
        io::ErrorKind::InvalidData => {
            if let Some(pe) = e.get_ref().and_then(|s| s.downcast_ref::<ProtocolError>()) {
                ChannelError::Protocol(pe.clone())
            } else {
                ChannelError::Io(e)
            }
        },
        _ => ChannelError::Io(e),
    }
}

impl ControlSession for SocketSession {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Socket
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn send(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        write_packet(&mut self.stream, packet).map_err(map_read_error)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Packet>, ChannelError> {
        self.apply_timeout(timeout)?;
        read_packet(&mut self.stream).map_err(map_read_error)
    }
}
