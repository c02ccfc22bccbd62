use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    AtlasResult, InfoResult, ListResult, ProgressEvent, ProgressSink, RegistrationResult,
    RemoveResult, SearchResult,
};
use crate::download::DownloadOutcome;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_search(result: &SearchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &DownloadOutcome) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_remove(result: &RemoveResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_registration(result: &RegistrationResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_atlas(result: &AtlasResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Phase feed for interactive runs, written to stderr.
pub struct ConsoleOutput;

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        let message = event.message.strip_prefix("phase=").unwrap_or(&event.message);
        match event.elapsed {
            Some(elapsed) => eprintln!("  {message} ({:.1}s)", elapsed.as_secs_f64()),
            None => eprintln!("  {message}"),
        }
    }
}
