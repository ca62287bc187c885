//! Plain-text source and word counting sink.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::DEFAULT_CHANNEL;
use crate::pipeline::module::{lock, Module, ModuleCore, SharedModule};
use crate::pipeline::packet::Packet;
use crate::pipeline::shutdown::ShutdownSignal;
use clap::{Arg, ArgMatches, Command};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Emits one packet per line of a file, then returns.
pub struct TextFileReader {
    core: ModuleCore,
    path: Mutex<Option<PathBuf>>,
}

impl TextFileReader {
    pub fn new(id: &str) -> Self {
        Self {
            core: ModuleCore::new(id),
            path: Mutex::new(None),
        }
    }
}

impl Module for TextFileReader {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "TextFileReader"
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(Arg::new("path").long("path").help("text file to read"))
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        *lock(&self.path) = matches.get_one::<String>("path").map(PathBuf::from);
        Ok(())
    }

    fn initialize(&self) -> PipelineResult<()> {
        match lock(&self.path).as_ref() {
            Some(path) if path.is_file() => Ok(()),
            Some(path) => Err(PipelineError::Initialization {
                module: self.core.id().to_string(),
                message: format!("{:?} is not a readable file", path),
            }),
            None => Err(PipelineError::Initialization {
                module: self.core.id().to_string(),
                message: "no path configured".into(),
            }),
        }
    }

    fn start_processing(&self, signal: &ShutdownSignal) -> PipelineResult<()> {
        let path = lock(&self.path)
            .clone()
            .ok_or_else(|| PipelineError::module(self.core.id(), "no path configured"))?;
        let reader = BufReader::new(std::fs::File::open(&path)?);
        let mut emitted = 0u64;
        for (index, line) in reader.lines().enumerate() {
            if signal.is_triggered() {
                break;
            }
            let mut packet = Packet::from_text(&line?).with_property("line", index as u64 + 1);
            self.core.submit_data(&mut packet, DEFAULT_CHANNEL)?;
            emitted += 1;
        }
        tracing::info!(module = %self.core.id(), lines = emitted, "finished reading {:?}", path);
        Ok(())
    }
}

/// Counts whitespace separated words and reports the total on finalize.
///
/// Each packet gets a `words` property before being forwarded. Writing the
/// `total` property resets the counter to the written value.
pub struct WordCounter {
    core: ModuleCore,
    total: AtomicU64,
}

impl WordCounter {
    pub fn new(id: &str) -> Self {
        Self {
            core: ModuleCore::new(id),
            total: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

impl Module for WordCounter {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "WordCounter"
    }

    fn on_incoming_data(&self, packet: &mut Packet, _channel: &str) -> PipelineResult<()> {
        let words = packet.text().split_whitespace().count() as u64;
        self.total.fetch_add(words, Ordering::AcqRel);
        packet.set_property("words", words);
        self.core.submit_data(packet, DEFAULT_CHANNEL)
    }

    fn finalize(&self) {
        println!("Total words: {}", self.total());
    }

    fn on_read_property(&self, name: &str) -> String {
        match name {
            "total" => self.total().to_string(),
            _ => String::new(),
        }
    }

    fn on_write_property(&self, name: &str, value: &str) -> String {
        if name != "total" {
            return String::new();
        }
        let Ok(value) = value.parse::<u64>() else {
            return String::new();
        };
        let _guard = self.core.lock_properties();
        self.total.store(value, Ordering::Release);
        self.core.mark_reconfigure();
        value.to_string()
    }

    fn on_enumerate_properties(&self) -> String {
        "total".to_string()
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(WordCounter::new(self.core.id())))
    }
}
