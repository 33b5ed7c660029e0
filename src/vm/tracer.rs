//! Buffered execution tracer for the interpreter.
//!
//! Separate from `tracing`: this writes one line per executed instruction, call, branch and
//! exception, which is far too chatty for a log subscriber.
//!
//! ## Environment Variables
//!
//! - `CIL_VM_TRACE`: where trace lines go
//!   - `"1"`, `"true"`, or `"stdout"`: standard output
//!   - `"stderr"`: standard error
//!   - anything else: a file created at that path
//! - `CIL_VM_TRACE_FLUSH_INTERVAL`: lines buffered before an automatic flush (default 10000)
//! - `CIL_VM_TRACE_STATS`: print per-event counts when the tracer is dropped
//!
//! ```bash
//! CIL_VM_TRACE=/tmp/trace.log CIL_VM_TRACE_STATS=1 cil-vm run program.il
//! ```
use crate::utils::{env_flag, env_number, il_label};
use std::{
    env,
    fmt::{self, Display, Formatter},
    fs::File,
    io::{stderr, stdout, BufWriter, Write},
};

const BUFFER_SIZE: usize = 64 * 1024;
const AUTO_FLUSH_INTERVAL: usize = 10_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    Error,
    Debug,
    Trace,
}

/// The kinds of line the tracer counts separately.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    Message,
    Instruction,
    Call,
    Return,
    Exception,
    Branch,
}

impl TraceEvent {
    const ALL: [TraceEvent; 6] = [
        TraceEvent::Message,
        TraceEvent::Instruction,
        TraceEvent::Call,
        TraceEvent::Return,
        TraceEvent::Exception,
        TraceEvent::Branch,
    ];
}

impl Display for TraceEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceEvent::Message => "messages",
            TraceEvent::Instruction => "instructions",
            TraceEvent::Call => "calls",
            TraceEvent::Return => "returns",
            TraceEvent::Exception => "exceptions",
            TraceEvent::Branch => "branches",
        })
    }
}

/// Lines written so far, by [`TraceEvent`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats([usize; 6]);

impl TraceStats {
    pub fn count(&self, event: TraceEvent) -> usize {
        self.0[event as usize]
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }
}

pub struct Tracer {
    writer: Option<BufWriter<Box<dyn Write + Send>>>,
    pending: usize,
    flush_interval: usize,
    stats: TraceStats,
    report_on_drop: bool,
}

impl Tracer {
    /// Builds a tracer from `CIL_VM_TRACE` and friends. Disabled when the variable is unset.
    pub fn from_env() -> Self {
        let sink: Option<Box<dyn Write + Send>> = match env::var("CIL_VM_TRACE").as_deref() {
            Ok("1" | "true" | "stdout") => Some(Box::new(stdout())),
            Ok("stderr") => Some(Box::new(stderr())),
            Ok("") | Err(_) => None,
            Ok(path) => match File::create(path) {
                Ok(f) => Some(Box::new(f)),
                Err(e) => {
                    tracing::warn!(path, error = %e, "cannot create trace file, tracing disabled");
                    None
                }
            },
        };
        Self {
            writer: sink.map(|w| BufWriter::with_capacity(BUFFER_SIZE, w)),
            flush_interval: env_number("CIL_VM_TRACE_FLUSH_INTERVAL", AUTO_FLUSH_INTERVAL).max(1),
            report_on_drop: env_flag("CIL_VM_TRACE_STATS"),
            ..Self::disabled()
        }
    }

    pub fn disabled() -> Self {
        Self {
            writer: None,
            pending: 0,
            flush_interval: AUTO_FLUSH_INTERVAL,
            stats: TraceStats::default(),
            report_on_drop: false,
        }
    }

    /// Traces into `writer`. Buffered output is flushed when the tracer is dropped.
    pub fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Some(BufWriter::with_capacity(BUFFER_SIZE, writer)),
            ..Self::disabled()
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    fn line(&mut self, event: TraceEvent, indent: usize, args: fmt::Arguments) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        // Trace output is best effort; a broken sink must not fail the guest.
        let _ = write!(writer, "{:width$}", "", width = indent * 2);
        let _ = writer.write_fmt(args);
        let _ = writer.write_all(b"\n");

        self.stats.0[event as usize] += 1;
        self.pending += 1;
        if self.pending >= self.flush_interval {
            let _ = writer.flush();
            self.pending = 0;
        }
    }

    pub fn msg(&mut self, level: TraceLevel, indent: usize, args: fmt::Arguments) {
        match level {
            TraceLevel::Error => self.line(TraceEvent::Message, indent, format_args!("[ERROR] {}", args)),
            TraceLevel::Debug | TraceLevel::Trace => self.line(TraceEvent::Message, indent, args),
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
        self.pending = 0;
    }

    pub fn trace_instruction(&mut self, indent: usize, pc: usize, instruction: &str) {
        self.line(
            TraceEvent::Instruction,
            indent,
            format_args!("{:?}: {}", il_label(pc), instruction),
        );
    }

    pub fn trace_method_entry(&mut self, indent: usize, name: &str, signature: &str) {
        if signature.is_empty() {
            self.line(TraceEvent::Call, indent, format_args!("-> {}", name));
        } else {
            self.line(TraceEvent::Call, indent, format_args!("-> {} {}", name, signature));
        }
    }

    pub fn trace_method_exit(&mut self, indent: usize, name: &str) {
        self.line(TraceEvent::Return, indent, format_args!("<- {}", name));
    }

    pub fn trace_exception(&mut self, indent: usize, exception: &str, pc: usize) {
        self.line(
            TraceEvent::Exception,
            indent,
            format_args!("!! {} at {:?}", exception, il_label(pc)),
        );
    }

    pub fn trace_branch(&mut self, indent: usize, mnemonic: &str, target: usize, taken: bool) {
        let status = if taken { "taken" } else { "not taken" };
        self.line(
            TraceEvent::Branch,
            indent,
            format_args!("{} {:?} ({})", mnemonic, il_label(target), status),
        );
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }

    fn report(&self) {
        eprintln!("trace summary:");
        for event in TraceEvent::ALL {
            eprintln!("  {:<14}{:>12}", event, self.stats.count(event));
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.report_on_drop && self.is_enabled() {
            self.report();
        }
        self.flush();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lines_are_indented_and_counted() {
        let sink = Sink::default();
        let mut tracer = Tracer::to_writer(Box::new(sink.clone()));
        tracer.trace_method_entry(0, "Main", "");
        tracer.trace_instruction(1, 3, "add");
        tracer.trace_exception(1, "System.OverflowException", 3);
        tracer.msg(TraceLevel::Error, 1, format_args!("boom"));
        tracer.flush();

        let out = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            out,
            "-> Main\n  IL_0003: add\n  !! System.OverflowException at IL_0003\n  [ERROR] boom\n"
        );
        let stats = tracer.stats();
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.count(TraceEvent::Instruction), 1);
        assert_eq!(stats.count(TraceEvent::Call), 1);
        assert_eq!(stats.count(TraceEvent::Branch), 0);
    }

    #[test]
    fn test_drop_flushes_buffered_lines() {
        let sink = Sink::default();
        {
            let mut tracer = Tracer::to_writer(Box::new(sink.clone()));
            tracer.trace_branch(0, "br.s", 0x10, true);
        }
        let out = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "br.s IL_0010 (taken)\n");
    }

    #[test]
    fn test_disabled_tracer_writes_nothing() {
        let mut tracer = Tracer::disabled();
        tracer.trace_branch(0, "br", 4, true);
        assert_eq!(tracer.stats(), TraceStats::default());
    }
}
