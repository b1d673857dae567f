//! Realtime voice session state, one entry per live connection.
//!
//! The phase machine is `Idle -(start)-> Listening -(stop)-> Processing
//! -(done)-> Idle`. Audio fragments are only accumulated while Listening;
//! fragments arriving in any other phase are expected stragglers and are
//! dropped silently. The transition into Processing happens before any
//! work starts so that late fragments are rejected correctly.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info};

/// Minimum buffered bytes worth sending to transcription.
pub const MIN_AUDIO_BYTES: usize = 1024;

pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicePhase {
    Idle,
    Listening,
    Processing,
}

#[derive(Debug)]
struct VoiceSession {
    phase: VoicePhase,
    buffer: Vec<u8>,
    language: String,
    speaker: Option<String>,
}

impl VoiceSession {
    fn new() -> Self {
        Self {
            phase: VoicePhase::Idle,
            buffer: Vec::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            speaker: None,
        }
    }
}

/// Captured input handed to the processing pipeline by [`begin_processing`].
///
/// [`begin_processing`]: VoiceSessionStore::begin_processing
#[derive(Debug)]
pub struct CapturedAudio {
    pub audio: Vec<u8>,
    pub language: String,
    pub speaker: Option<String>,
}

#[derive(Debug, Default)]
pub struct VoiceSessionStore {
    sessions: Mutex<HashMap<String, VoiceSession>>,
}

impl VoiceSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, connection_id: &str) {
        info!(connection_id, "voice client connected");
        self.sessions
            .lock()
            .expect("voice session lock poisoned")
            .insert(connection_id.to_string(), VoiceSession::new());
    }

    pub fn disconnect(&self, connection_id: &str) {
        info!(connection_id, "voice client disconnected");
        self.sessions
            .lock()
            .expect("voice session lock poisoned")
            .remove(connection_id);
    }

    pub fn set_settings(
        &self,
        connection_id: &str,
        language: Option<&str>,
        speaker: Option<&str>,
    ) {
        let mut sessions = self.sessions.lock().expect("voice session lock poisoned");
        let Some(session) = sessions.get_mut(connection_id) else {
            debug!(connection_id, "settings from unknown connection ignored");
            return;
        };
        if let Some(language) = language {
            session.language = language.to_string();
        }
        if let Some(speaker) = speaker {
            // "default" clears the preference.
            session.speaker = (speaker != "default").then(|| speaker.to_string());
        }
    }

    /// Clears the buffer and moves the session to Listening. Returns false
    /// for an unknown connection.
    pub fn start(&self, connection_id: &str, language: Option<&str>) -> bool {
        let mut sessions = self.sessions.lock().expect("voice session lock poisoned");
        let Some(session) = sessions.get_mut(connection_id) else {
            return false;
        };
        session.phase = VoicePhase::Listening;
        session.buffer.clear();
        if let Some(language) = language {
            session.language = language.to_string();
        }
        info!(connection_id, language = %session.language, "voice session listening");
        true
    }

    /// Appends an audio fragment, but only while Listening. Fragments in
    /// any other phase are dropped without error.
    pub fn push_chunk(&self, connection_id: &str, bytes: &[u8]) {
        let mut sessions = self.sessions.lock().expect("voice session lock poisoned");
        let Some(session) = sessions.get_mut(connection_id) else {
            return;
        };
        if session.phase == VoicePhase::Listening {
            session.buffer.extend_from_slice(bytes);
        } else {
            debug!(connection_id, phase = ?session.phase, "audio fragment dropped");
        }
    }

    /// The stop transition. Only valid from Listening; otherwise logged and
    /// `None` is returned with no state change. On success the session is
    /// already in Processing and the buffer has been taken, so fragments
    /// arriving afterwards are rejected before any work begins.
    pub fn begin_processing(&self, connection_id: &str) -> Option<CapturedAudio> {
        let mut sessions = self.sessions.lock().expect("voice session lock poisoned");
        let session = sessions.get_mut(connection_id)?;
        if session.phase != VoicePhase::Listening {
            info!(connection_id, phase = ?session.phase, "stop ignored outside listening");
            return None;
        }
        session.phase = VoicePhase::Processing;
        Some(CapturedAudio {
            audio: std::mem::take(&mut session.buffer),
            language: session.language.clone(),
            speaker: session.speaker.clone(),
        })
    }

    /// Returns the session to Idle once processing ends, on success or
    /// failure alike.
    pub fn finish(&self, connection_id: &str) {
        let mut sessions = self.sessions.lock().expect("voice session lock poisoned");
        if let Some(session) = sessions.get_mut(connection_id) {
            session.phase = VoicePhase::Idle;
            debug!(connection_id, "voice session idle");
        }
    }

    pub fn phase(&self, connection_id: &str) -> Option<VoicePhase> {
        self.sessions
            .lock()
            .expect("voice session lock poisoned")
            .get(connection_id)
            .map(|s| s.phase)
    }

    pub fn speaker(&self, connection_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .expect("voice session lock poisoned")
            .get(connection_id)
            .and_then(|s| s.speaker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_phase_cycle() {
        let store = VoiceSessionStore::new();
        store.connect("c1");
        assert_eq!(store.phase("c1"), Some(VoicePhase::Idle));

        assert!(store.start("c1", Some("de")));
        assert_eq!(store.phase("c1"), Some(VoicePhase::Listening));

        store.push_chunk("c1", &[0u8; 2048]);
        let captured = store.begin_processing("c1").unwrap();
        assert_eq!(captured.audio.len(), 2048);
        assert_eq!(captured.language, "de");
        assert_eq!(store.phase("c1"), Some(VoicePhase::Processing));

        store.finish("c1");
        assert_eq!(store.phase("c1"), Some(VoicePhase::Idle));
    }

    #[test]
    fn stop_outside_listening_is_a_no_op() {
        let store = VoiceSessionStore::new();
        store.connect("c1");
        assert!(store.begin_processing("c1").is_none());
        assert_eq!(store.phase("c1"), Some(VoicePhase::Idle));
    }

    #[test]
    fn fragments_outside_listening_are_dropped() {
        let store = VoiceSessionStore::new();
        store.connect("c1");
        store.push_chunk("c1", &[1, 2, 3]);
        store.start("c1", None);
        store.push_chunk("c1", &[4, 5]);
        let captured = store.begin_processing("c1").unwrap();
        assert_eq!(captured.audio, vec![4, 5]);

        // Late fragment after the stop transition.
        store.push_chunk("c1", &[6]);
        store.finish("c1");
        store.start("c1", None);
        assert!(store.begin_processing("c1").unwrap().audio.is_empty());
    }

    #[test]
    fn start_clears_any_previous_buffer() {
        let store = VoiceSessionStore::new();
        store.connect("c1");
        store.start("c1", None);
        store.push_chunk("c1", &[9; 100]);
        store.start("c1", None);
        assert!(store.begin_processing("c1").unwrap().audio.is_empty());
    }

    #[test]
    fn default_speaker_clears_the_preference() {
        let store = VoiceSessionStore::new();
        store.connect("c1");
        store.set_settings("c1", None, Some("p225"));
        assert_eq!(store.speaker("c1").as_deref(), Some("p225"));
        store.set_settings("c1", None, Some("default"));
        assert_eq!(store.speaker("c1"), None);
    }

    #[test]
    fn unknown_connections_are_ignored() {
        let store = VoiceSessionStore::new();
        assert!(!store.start("ghost", None));
        store.push_chunk("ghost", &[1]);
        assert!(store.begin_processing("ghost").is_none());
        assert_eq!(store.phase("ghost"), None);
    }
}
