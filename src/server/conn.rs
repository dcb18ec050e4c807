//! Byte-stream plumbing under the protocol adapters: plain TCP, TLS, and the
//! cleartext HTTP/2 preface sniff.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use super::channel::Protocol;

/// Anything the protocol adapters can speak over. Blanket-implemented so a
/// `may` TCP socket and a rustls stream both qualify.
pub trait ByteStream: Read + Write + Send {}

impl<T: Read + Write + Send> ByteStream for T {}

pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// A connection with its protocol decided and any sniffed bytes preserved.
pub struct Accepted {
    pub stream: Box<dyn ByteStream>,
    /// Bytes already read off the socket during negotiation; the adapter
    /// consumes these before reading the stream again.
    pub leftover: Vec<u8>,
    pub protocol: Protocol,
}

/// Load certificate + key and build a server config offering `h2` and
/// `http/1.1` over ALPN.
pub fn load_tls_config(cert: &Path, key: &Path) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key.display()))?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Finish TLS (when configured) and decide the protocol: ALPN on TLS,
/// preface sniffing on cleartext.
pub fn accept_stream(
    tcp: may::net::TcpStream,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> io::Result<Accepted> {
    match tls {
        Some(config) => {
            let conn = rustls::ServerConnection::new(config).map_err(io::Error::other)?;
            let mut stream = rustls::StreamOwned::new(conn, tcp);
            while stream.conn.is_handshaking() {
                stream.conn.complete_io(&mut stream.sock)?;
            }
            let protocol = match stream.conn.alpn_protocol() {
                Some(proto) if proto == b"h2" => Protocol::Http2,
                _ => Protocol::Http1,
            };
            Ok(Accepted {
                stream: Box::new(stream),
                leftover: Vec::new(),
                protocol,
            })
        }
        None => sniff_cleartext(Box::new(tcp)),
    }
}

fn sniff_cleartext(mut stream: Box<dyn ByteStream>) -> io::Result<Accepted> {
    let mut buf: Vec<u8> = Vec::with_capacity(H2_PREFACE.len());
    let mut chunk = [0u8; 256];
    loop {
        if buf.len() >= H2_PREFACE.len() || !H2_PREFACE.starts_with(&buf[..buf.len().min(H2_PREFACE.len())]) {
            break;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let protocol = if buf.len() >= H2_PREFACE.len() && buf.starts_with(H2_PREFACE) {
        Protocol::Http2
    } else {
        Protocol::Http1
    };
    Ok(Accepted {
        stream,
        leftover: buf,
        protocol,
    })
}
