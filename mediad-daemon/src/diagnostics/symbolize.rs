//! Turning captured instruction pointers into a readable trace.
//!
//! Runs on the crash-reporter thread, never inside a signal handler.

use std::ffi::CStr;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::signal_name;

/// What the fault handler captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub signal: i32,
    /// Faulting address; `None` when the signal was sent by another process.
    pub fault_addr: Option<usize>,
    /// Raw instruction pointers, innermost first.
    pub frames: Vec<usize>,
}

/// Where a frame lives: the object file and the address relative to its load base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLocation {
    pub object: PathBuf,
    pub offset: usize,
}

pub trait SymbolResolver {
    /// Find the binary or shared object that contains `ip`.
    fn locate(&self, ip: usize, exe: &Path) -> FrameLocation {
        locate_with_dladdr(ip).unwrap_or_else(|| FrameLocation {
            object: exe.to_path_buf(),
            offset: ip,
        })
    }

    /// Resolve a location to `file:line`.
    fn resolve(&self, location: &FrameLocation) -> io::Result<String>;
}

/// Shells out to `addr2line` once per frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Addr2Line;

impl SymbolResolver for Addr2Line {
    fn resolve(&self, location: &FrameLocation) -> io::Result<String> {
        let output = Command::new("addr2line")
            .arg("-s")
            .arg("-e")
            .arg(&location.object)
            .arg(format!("{:#x}", location.offset))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(io::Error::other(format!(
                "addr2line exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() || text.starts_with("??") {
            return Err(io::Error::other("no line information"));
        }
        Ok(text)
    }
}

fn locate_with_dladdr(ip: usize) -> Option<FrameLocation> {
    // SAFETY: Dl_info is plain data; dladdr only writes into it.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr accepts any address and reports failure with 0.
    let found = unsafe { libc::dladdr(ip as *const libc::c_void, &mut info) };
    if found == 0 || info.dli_fname.is_null() {
        return None;
    }
    // SAFETY: dli_fname is a NUL-terminated string owned by the dynamic loader.
    let name = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
    if name.is_empty() {
        return None;
    }
    Some(FrameLocation {
        object: PathBuf::from(name.as_ref()),
        offset: ip.wrapping_sub(info.dli_fbase as usize),
    })
}

/// Write the trace. Frame 0 is the capture point and is skipped.
///
/// A frame that cannot be resolved prints its raw address; rendering never
/// stops early.
pub fn render(
    report: &CrashReport,
    exe: &Path,
    resolver: &dyn SymbolResolver,
    out: &mut dyn Write,
) -> io::Result<()> {
    let name = signal_name(report.signal);
    match report.fault_addr {
        Some(addr) => writeln!(
            out,
            "Got signal {} ({name}), faulty address is {addr:#x}",
            report.signal
        )?,
        None => writeln!(out, "Got signal {} ({name})", report.signal)?,
    }
    writeln!(out, "\t[bt] Execution path:")?;
    out.flush()?;

    for (idx, &ip) in report.frames.iter().enumerate().skip(1) {
        let location = resolver.locate(ip, exe);
        writeln!(
            out,
            "\t[bt] #{idx} {}(+{:#x}) [{ip:#x}]",
            location.object.display(),
            location.offset
        )?;
        match resolver.resolve(&location) {
            Ok(line) => writeln!(out, "\t[bt]\t\t{line}")?,
            Err(_) => writeln!(out, "\t[bt]\t\t{ip:#x}")?,
        }
        // The fault handler may exit before the reporter finishes.
        out.flush()?;
    }
    Ok(())
}
