//! Printer adapters for sending ticket data
//!
//! Supports:
//! - Network printers (TCP port 9100)
//! - Windows driver printers (via Win32 API)
//! - Console and file printers that receive plain text (mock mode)

use crate::error::{PrintError, PrintResult};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// Default raw printing port
pub const DEFAULT_PORT: u16 = 9100;

/// DLE EOT 2: offline cause
const STATUS_OFFLINE_CAUSE: [u8; 3] = [0x10, 0x04, 0x02];
/// DLE EOT 4: roll paper sensor
const STATUS_PAPER_SENSOR: [u8; 3] = [0x10, 0x04, 0x04];
/// Printers without real-time status stay silent
const STATUS_REPLY_TIMEOUT: Duration = Duration::from_millis(300);

/// Trait for printer adapters
#[allow(async_fn_in_trait)]
pub trait Printer {
    /// Send data to the printer
    async fn print(&self, data: &[u8]) -> PrintResult<()>;

    /// Check if the printer is online/reachable
    async fn is_online(&self) -> bool;

    /// Whether this printer takes ESC/POS bytes (true) or plain text (false)
    fn accepts_escpos(&self) -> bool {
        true
    }
}

/// Network printer (TCP port 9100)
///
/// Most thermal printers support raw TCP printing on port 9100.
#[derive(Debug, Clone)]
pub struct NetworkPrinter {
    addr: SocketAddr,
    timeout: Duration,
    status_check: bool,
}

impl NetworkPrinter {
    /// Create a new network printer
    pub fn new(host: &str, port: u16) -> PrintResult<Self> {
        Self::from_addr(&format!("{}:{}", host, port))
    }

    /// Create from an address string (e.g. "192.168.1.100:9100" or "printer.local")
    ///
    /// Port 9100 is used if the address has none. Host names are resolved once.
    pub fn from_addr(addr: &str) -> PrintResult<Self> {
        let with_port = if addr.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
            addr.to_string()
        } else {
            format!("{}:{}", addr, DEFAULT_PORT)
        };

        let invalid = || PrintError::InvalidConfig(format!("Invalid address: {}", addr));
        let addr = match with_port.parse::<SocketAddr>() {
            Ok(a) => a,
            Err(_) => {
                let host = with_port.rsplit_once(':').map(|(h, _)| h).unwrap_or_default();
                if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == ':') {
                    return Err(invalid());
                }
                with_port
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut it| it.next())
                    .ok_or_else(invalid)?
            }
        };

        Ok(Self {
            addr,
            timeout: Duration::from_secs(5),
            status_check: false,
        })
    }

    /// Set connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the printer for its real-time status (DLE EOT) before each job
    ///
    /// Cover open or paper out fail the job with [`PrintError::DeviceFault`].
    /// A printer that does not answer is assumed healthy.
    pub fn with_status_check(mut self, enabled: bool) -> Self {
        self.status_check = enabled;
        self
    }

    /// Get the printer address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn check_status(&self, stream: &mut TcpStream) -> PrintResult<()> {
        stream.write_all(&STATUS_OFFLINE_CAUSE).await?;
        let Some(cause) = read_status_byte(stream).await? else {
            debug!("No real-time status reply, printing anyway");
            return Ok(());
        };
        stream.write_all(&STATUS_PAPER_SENSOR).await?;
        let paper = read_status_byte(stream).await?;

        match device_fault(cause, paper) {
            Some(fault) => Err(PrintError::DeviceFault(format!("{}: {}", self.addr, fault))),
            None => Ok(()),
        }
    }
}

async fn read_status_byte(stream: &mut TcpStream) -> PrintResult<Option<u8>> {
    let mut byte = [0u8; 1];
    match tokio::time::timeout(STATUS_REPLY_TIMEOUT, stream.read_exact(&mut byte)).await {
        Err(_) => Ok(None),
        Ok(Ok(_)) => Ok(Some(byte[0]).filter(|b| is_status_byte(*b))),
        Ok(Err(e)) => Err(e.into()),
    }
}

/// Status bytes have bit 1 and bit 4 set, bit 0 and bit 7 clear
fn is_status_byte(b: u8) -> bool {
    b & 0x93 == 0x12
}

/// Fault named by the DLE EOT 2 / DLE EOT 4 replies, if any
fn device_fault(offline_cause: u8, paper_sensor: Option<u8>) -> Option<&'static str> {
    if offline_cause & 0x04 != 0 {
        return Some("cover open");
    }
    if offline_cause & 0x20 != 0 || paper_sensor.is_some_and(|p| p & 0x60 != 0) {
        return Some("paper out");
    }
    if offline_cause & 0x40 != 0 {
        return Some("device error");
    }
    None
}

impl Printer for NetworkPrinter {
    #[instrument(skip(self, data), fields(addr = %self.addr, data_len = data.len()))]
    async fn print(&self, data: &[u8]) -> PrintResult<()> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PrintError::Timeout(format!("Connection timeout: {}", self.addr)))?
            .map_err(|e| PrintError::Connection(format!("{}: {}", self.addr, e)))?;

        if self.status_check {
            self.check_status(&mut stream).await?;
        }

        tokio::time::timeout(self.timeout, stream.write_all(data))
            .await
            .map_err(|_| PrintError::Timeout(format!("Write timeout: {}", self.addr)))?
            .map_err(|e| {
                PrintError::Io(std::io::Error::new(e.kind(), format!("Write failed: {}", e)))
            })?;

        stream.flush().await?;
        let _ = stream.shutdown().await;

        info!("Print job sent");
        Ok(())
    }

    #[instrument(skip(self), fields(addr = %self.addr))]
    async fn is_online(&self) -> bool {
        let check_timeout = Duration::from_millis(500);

        match tokio::time::timeout(check_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Printer offline");
                false
            }
            Err(_) => {
                warn!("Printer check timeout");
                false
            }
        }
    }
}

/// Mock printer writing ticket text to stdout
#[derive(Debug, Clone, Default)]
pub struct ConsolePrinter;

impl Printer for ConsolePrinter {
    async fn print(&self, data: &[u8]) -> PrintResult<()> {
        let mut out = tokio::io::stdout();
        out.write_all(b"--- MOCK PRINTER OUTPUT START ---\n").await?;
        out.write_all(data).await?;
        out.write_all(b"\n--- CUT ---\n--- MOCK PRINTER OUTPUT END ---\n")
            .await?;
        out.flush().await?;
        Ok(())
    }

    async fn is_online(&self) -> bool {
        true
    }

    fn accepts_escpos(&self) -> bool {
        false
    }
}

/// Printer that appends ticket text to a file
#[derive(Debug, Clone)]
pub struct FilePrinter {
    path: PathBuf,
}

impl FilePrinter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Printer for FilePrinter {
    #[instrument(skip(self, data), fields(path = %self.path.display(), data_len = data.len()))]
    async fn print(&self, data: &[u8]) -> PrintResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(data).await?;
        file.write_all(b"\n\x0C\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn is_online(&self) -> bool {
        self.path
            .parent()
            .is_none_or(|p| p.as_os_str().is_empty() || p.exists())
    }

    fn accepts_escpos(&self) -> bool {
        false
    }
}

/// Any supported printer, selected from a target string
///
/// | Target | Printer |
/// |--------|---------|
/// | `tcp://host:port`, `host:port` | [`NetworkPrinter`] |
/// | `windows:NAME` | `WindowsPrinter` (Windows only) |
/// | `console` | [`ConsolePrinter`] |
/// | `file:PATH` | [`FilePrinter`] |
#[derive(Debug, Clone)]
pub enum AnyPrinter {
    Network(NetworkPrinter),
    Console(ConsolePrinter),
    File(FilePrinter),
    #[cfg(windows)]
    Windows(WindowsPrinter),
}

impl AnyPrinter {
    /// Parse a printer target string
    pub fn from_target(target: &str) -> PrintResult<Self> {
        let target = target.trim();
        if target.is_empty() {
            return Err(PrintError::InvalidConfig("empty printer target".to_string()));
        }
        if target.eq_ignore_ascii_case("console") {
            return Ok(AnyPrinter::Console(ConsolePrinter));
        }
        if let Some(path) = target.strip_prefix("file:") {
            if path.is_empty() {
                return Err(PrintError::InvalidConfig("file: target needs a path".to_string()));
            }
            return Ok(AnyPrinter::File(FilePrinter::new(path)));
        }
        if let Some(name) = target.strip_prefix("windows:") {
            return Self::windows(name);
        }
        let addr = target.strip_prefix("tcp://").unwrap_or(target);
        Ok(AnyPrinter::Network(NetworkPrinter::from_addr(addr)?))
    }

    #[cfg(windows)]
    fn windows(name: &str) -> PrintResult<Self> {
        let name = if name.is_empty() { None } else { Some(name) };
        Ok(AnyPrinter::Windows(WindowsPrinter::new(&WindowsPrinter::resolve(name)?)))
    }

    #[cfg(not(windows))]
    fn windows(name: &str) -> PrintResult<Self> {
        Err(PrintError::InvalidConfig(format!(
            "driver printer '{}' is only supported on Windows",
            name
        )))
    }

    /// Enable DLE EOT status checks on network printers; other kinds ignore it
    pub fn with_status_check(self, enabled: bool) -> Self {
        match self {
            AnyPrinter::Network(p) => AnyPrinter::Network(p.with_status_check(enabled)),
            other => other,
        }
    }

    /// Short human readable description for logs
    pub fn describe(&self) -> String {
        match self {
            AnyPrinter::Network(p) => format!("tcp://{}", p.addr()),
            AnyPrinter::Console(_) => "console".to_string(),
            AnyPrinter::File(p) => format!("file:{}", p.path().display()),
            #[cfg(windows)]
            AnyPrinter::Windows(p) => format!("windows:{}", p.name()),
        }
    }
}

impl Printer for AnyPrinter {
    async fn print(&self, data: &[u8]) -> PrintResult<()> {
        match self {
            AnyPrinter::Network(p) => p.print(data).await,
            AnyPrinter::Console(p) => p.print(data).await,
            AnyPrinter::File(p) => p.print(data).await,
            #[cfg(windows)]
            AnyPrinter::Windows(p) => p.print(data).await,
        }
    }

    async fn is_online(&self) -> bool {
        match self {
            AnyPrinter::Network(p) => p.is_online().await,
            AnyPrinter::Console(p) => p.is_online().await,
            AnyPrinter::File(p) => p.is_online().await,
            #[cfg(windows)]
            AnyPrinter::Windows(p) => p.is_online().await,
        }
    }

    fn accepts_escpos(&self) -> bool {
        match self {
            AnyPrinter::Network(p) => p.accepts_escpos(),
            AnyPrinter::Console(p) => p.accepts_escpos(),
            AnyPrinter::File(p) => p.accepts_escpos(),
            #[cfg(windows)]
            AnyPrinter::Windows(p) => p.accepts_escpos(),
        }
    }
}

/// Windows driver printer
///
/// Uses Win32 API to print through installed printer drivers (RAW datatype).
#[cfg(windows)]
#[derive(Debug, Clone)]
pub struct WindowsPrinter {
    name: String,
}

#[cfg(windows)]
impl WindowsPrinter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// List installed printers
    pub fn list() -> PrintResult<Vec<String>> {
        use windows::Win32::Graphics::Printing::{
            EnumPrintersW, PRINTER_ENUM_CONNECTIONS, PRINTER_ENUM_LOCAL, PRINTER_INFO_5W,
        };
        use windows::core::PWSTR;

        unsafe {
            let flags = PRINTER_ENUM_LOCAL | PRINTER_ENUM_CONNECTIONS;
            let mut needed: u32 = 0;
            let mut returned: u32 = 0;

            let _ = EnumPrintersW(flags, None, 5, None, &mut needed, &mut returned);
            if needed == 0 {
                return Ok(Vec::new());
            }

            let mut buf: Vec<u8> = vec![0; needed as usize];
            EnumPrintersW(
                flags,
                None,
                5,
                Some(buf.as_mut_slice()),
                &mut needed,
                &mut returned,
            )
            .map_err(|_| PrintError::WindowsPrinter("EnumPrintersW failed".to_string()))?;

            let ptr = buf.as_ptr() as *const PRINTER_INFO_5W;
            let slice = std::slice::from_raw_parts(ptr, returned as usize);

            Ok(slice
                .iter()
                .filter(|info| !info.pPrinterName.is_null())
                .filter_map(|info| PWSTR(info.pPrinterName.0).to_string().ok())
                .collect())
        }
    }

    /// Resolve a printer name: the given one if installed, else the system default
    pub fn resolve(name: Option<&str>) -> PrintResult<String> {
        use windows::Win32::Graphics::Printing::GetDefaultPrinterW;
        use windows::core::PWSTR;

        let printers = Self::list()?;
        if let Some(name) = name {
            if printers.iter().any(|p| p == name) {
                return Ok(name.to_string());
            }
            return Err(PrintError::InvalidConfig(format!(
                "Printer not found: {} (available: {})",
                name,
                printers.join(", ")
            )));
        }

        unsafe {
            let mut needed: u32 = 0;
            let _ = GetDefaultPrinterW(None, &mut needed);
            if needed > 0 {
                let mut buf: Vec<u16> = vec![0; needed as usize];
                if GetDefaultPrinterW(Some(PWSTR(buf.as_mut_ptr())), &mut needed).as_bool()
                    && let Ok(name) = PWSTR(buf.as_mut_ptr()).to_string()
                {
                    return Ok(name);
                }
            }
        }

        printers
            .first()
            .cloned()
            .ok_or_else(|| PrintError::InvalidConfig("No printers available".to_string()))
    }

    /// Spooler status bits for this printer (0 when unknown)
    fn spooler_status(name: &str) -> PrintResult<u32> {
        use windows::Win32::Graphics::Printing::{
            ClosePrinter, GetPrinterW, OpenPrinterW, PRINTER_HANDLE, PRINTER_INFO_6,
        };
        use windows::core::PCWSTR;

        unsafe {
            let mut handle = PRINTER_HANDLE::default();
            let name_w = to_wide(name);
            OpenPrinterW(PCWSTR::from_raw(name_w.as_ptr()), &mut handle, None)
                .map_err(|_| PrintError::WindowsPrinter("OpenPrinterW failed".to_string()))?;

            let mut needed: u32 = 0;
            let _ = GetPrinterW(handle, 6, None, &mut needed);
            let mut status = 0;
            if needed > 0 {
                let mut buf: Vec<u8> = vec![0; needed as usize];
                if GetPrinterW(handle, 6, Some(buf.as_mut_slice()), &mut needed).is_ok() {
                    let info = *(buf.as_ptr() as *const PRINTER_INFO_6);
                    status = info.dwStatus;
                }
            }
            let _ = ClosePrinter(handle);
            Ok(status)
        }
    }

    fn write_raw(&self, data: &[u8]) -> PrintResult<()> {
        use core::ffi::c_void;
        use windows::Win32::Graphics::Printing::{
            ClosePrinter, DOC_INFO_1W, EndDocPrinter, EndPagePrinter, OpenPrinterW, PRINTER_HANDLE,
            StartDocPrinterW, StartPagePrinter, WritePrinter,
        };
        use windows::core::{PCWSTR, PWSTR};

        if let Some(err) = Self::spooler_status(&self.name)
            .ok()
            .and_then(|status| spooler_status_error(&self.name, status))
        {
            return Err(err);
        }

        unsafe {
            let mut handle = PRINTER_HANDLE::default();
            let name_w = to_wide(&self.name);
            OpenPrinterW(PCWSTR::from_raw(name_w.as_ptr()), &mut handle, None)
                .map_err(|_| PrintError::Offline(format!("cannot open {}", self.name)))?;

            let doc_name_w = to_wide("Kitchen Ticket");
            let datatype_w = to_wide("RAW");
            let doc_info = DOC_INFO_1W {
                pDocName: PWSTR(doc_name_w.as_ptr() as *mut _),
                pOutputFile: PWSTR::null(),
                pDatatype: PWSTR(datatype_w.as_ptr() as *mut _),
            };

            if StartDocPrinterW(handle, 1, &doc_info as *const DOC_INFO_1W) == 0 {
                let _ = ClosePrinter(handle);
                return Err(PrintError::WindowsPrinter("StartDocPrinter failed".to_string()));
            }
            if !StartPagePrinter(handle).as_bool() {
                let _ = EndDocPrinter(handle);
                let _ = ClosePrinter(handle);
                return Err(PrintError::WindowsPrinter("StartPagePrinter failed".to_string()));
            }

            let mut written: u32 = 0;
            let ok = WritePrinter(
                handle,
                data.as_ptr() as *const c_void,
                data.len() as u32,
                &mut written,
            );

            let _ = EndPagePrinter(handle);
            let _ = EndDocPrinter(handle);
            let _ = ClosePrinter(handle);

            if !ok.as_bool() || written != data.len() as u32 {
                // The spooler took the job but the device did not: usually busy
                return Err(PrintError::Offline(format!(
                    "{}: wrote {} of {} bytes",
                    self.name,
                    written,
                    data.len()
                )));
            }
            Ok(())
        }
    }
}

/// Spooler status bits (winspool.h)
mod spooler {
    pub const ERROR: u32 = 0x0000_0002;
    pub const PAPER_JAM: u32 = 0x0000_0008;
    pub const PAPER_OUT: u32 = 0x0000_0010;
    pub const OFFLINE: u32 = 0x0000_0080;
    pub const OUTPUT_BIN_FULL: u32 = 0x0000_0800;
    pub const NOT_AVAILABLE: u32 = 0x0000_1000;
    pub const NO_TONER: u32 = 0x0004_0000;
    pub const USER_INTERVENTION: u32 = 0x0010_0000;
    pub const DOOR_OPEN: u32 = 0x0040_0000;
}

/// Map spooler status to an error: offline is transient, hardware faults are not
#[cfg_attr(not(windows), allow(dead_code))]
fn spooler_status_error(name: &str, status: u32) -> Option<PrintError> {
    const FAULTS: [(u32, &str); 7] = [
        (spooler::DOOR_OPEN, "cover open"),
        (spooler::PAPER_OUT, "paper out"),
        (spooler::PAPER_JAM, "paper jam"),
        (spooler::NO_TONER, "out of ink"),
        (spooler::OUTPUT_BIN_FULL, "output bin full"),
        (spooler::USER_INTERVENTION, "needs attention"),
        (spooler::ERROR, "device error"),
    ];
    if let Some((_, fault)) = FAULTS.iter().find(|(bit, _)| status & bit != 0) {
        return Some(PrintError::DeviceFault(format!("{}: {}", name, fault)));
    }
    if status & (spooler::OFFLINE | spooler::NOT_AVAILABLE) != 0 {
        return Some(PrintError::Offline(name.to_string()));
    }
    None
}

#[cfg(windows)]
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(windows)]
impl Printer for WindowsPrinter {
    async fn print(&self, data: &[u8]) -> PrintResult<()> {
        // Spooler calls are blocking
        let printer = self.clone();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || printer.write_raw(&data))
            .await
            .map_err(|e| PrintError::WindowsPrinter(format!("Task join failed: {}", e)))?
    }

    async fn is_online(&self) -> bool {
        Self::spooler_status(&self.name).is_ok_and(|status| spooler_status_error(&self.name, status).is_none())
    }
}
