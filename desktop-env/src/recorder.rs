// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! JSON Lines event recorder
//!
//! Every record is one line:
//!
//! ```text
//! {"timestamp_ns":1718000000000000000,"source":"keyboard","event":{"device":"keyboard",...}}
//! ```
//!
//! Input events recorded this way can be read back with
//! [`load_input_events`] and fed to [`crate::event::replay_all`].

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::callback::Callback;
use crate::error::Result;
use crate::event::InputEvent;
use crate::protocol::{now_ns, WindowInfo};

#[derive(Serialize)]
struct Record<'a, T> {
    timestamp_ns: i64,
    source: &'a str,
    event: &'a T,
}

#[derive(Deserialize)]
struct StoredRecord {
    source: String,
    event: serde_json::Value,
}

/// Appends events to a JSON Lines sink
pub struct JsonlRecorder {
    writer: Mutex<Box<dyn Write + Send>>,
    records: AtomicU64,
}

impl JsonlRecorder {
    /// Create (or truncate) `path` and record into it.
    pub fn create(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let file = File::create(path)?;
        info!("Recording events to {}", path.display());
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            records: AtomicU64::new(0),
        })
    }

    /// Append one record and flush it.
    pub fn record<T: Serialize>(&self, source: &str, event: &T) -> Result<()> {
        let record = Record {
            timestamp_ns: now_ns(),
            source,
            event,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&line)?;
        writer.flush()?;
        self.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Callback recording window changes under the source `"window"`.
    pub fn window_sink(self: &Arc<Self>) -> Callback<WindowInfo> {
        let recorder = self.clone();
        Arc::new(move |window: WindowInfo| Ok(recorder.record("window", &window)?))
    }

    /// Callback recording input events under `source`.
    pub fn input_sink(self: &Arc<Self>, source: &'static str) -> Callback<InputEvent> {
        let recorder = self.clone();
        Arc::new(move |event: InputEvent| Ok(recorder.record(source, &event)?))
    }

    /// Records written so far
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }
}

/// Read the input events of a recording, skipping other records.
///
/// # Errors
///
/// Fails on I/O errors and on lines that are not JSON records.
pub fn load_input_events(reader: impl BufRead) -> Result<Vec<InputEvent>> {
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: StoredRecord = serde_json::from_str(&line)?;
        match serde_json::from_value::<InputEvent>(record.event) {
            Ok(event) => events.push(event),
            Err(_) => debug!("Skipping non-input record from '{}'", record.source),
        }
    }
    Ok(events)
}

/// [`load_input_events`] over the file at `path`.
pub fn load_input_file(path: impl AsRef<Path>) -> Result<Vec<InputEvent>> {
    load_input_events(BufReader::new(File::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MouseButton;
    use crate::platform::stub::test_window;
    use std::io::Cursor;

    /// Writer whose contents the test can read back
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_record_line_format() {
        let buffer = SharedBuffer::default();
        let recorder = JsonlRecorder::from_writer(buffer.clone());
        recorder
            .record("keyboard", &InputEvent::key_press(0x41).with_time(7))
            .unwrap();

        let line = buffer.contents();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["source"], "keyboard");
        assert_eq!(value["event"]["device"], "keyboard");
        assert_eq!(value["event"]["vk"], 0x41);
        assert_eq!(value["event"]["time_ns"], 7);
        assert!(value["timestamp_ns"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_sinks_and_load_round_trip() {
        let buffer = SharedBuffer::default();
        let recorder = JsonlRecorder::from_writer(buffer.clone());
        let keyboard = recorder.input_sink("keyboard");
        let mouse = recorder.input_sink("mouse");
        let window = recorder.window_sink();

        keyboard(InputEvent::key_press(0x42).with_time(1)).unwrap();
        window(test_window("ZType", 3)).unwrap();
        mouse(InputEvent::mouse_click(1, 2, MouseButton::Middle, false).with_time(2)).unwrap();
        assert_eq!(recorder.records(), 3);

        let events = load_input_events(Cursor::new(buffer.contents())).unwrap();
        assert_eq!(
            events,
            vec![
                InputEvent::key_press(0x42).with_time(1),
                InputEvent::mouse_click(1, 2, MouseButton::Middle, false).with_time(2),
            ]
        );
    }

    #[test]
    fn test_load_rejects_garbage() {
        let err = load_input_events(Cursor::new("not json\n")).unwrap_err();
        assert!(matches!(err, crate::error::DesktopError::Json(_)));
    }

    #[test]
    fn test_load_skips_blank_lines() {
        let events = load_input_events(Cursor::new("\n\n")).unwrap();
        assert!(events.is_empty());
    }
}
