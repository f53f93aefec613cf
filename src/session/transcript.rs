use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::transport::{Speaker, TranscriptionEvent};

/// One coalesced turn of the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub sender: Speaker,
    pub text: String,
    /// Set once a fragment arrives with `finished: true`
    pub complete: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who is currently talking, derived from the latest transcription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpeakingFlags {
    pub user: bool,
    pub agent: bool,
}

impl SpeakingFlags {
    /// Flags after `event`: the sender speaks until its fragment is finished,
    /// the other side is silent.
    pub fn after(event: &TranscriptionEvent) -> Self {
        let speaking = event.finished != Some(true);
        match event.sender {
            Speaker::User => Self {
                user: speaking,
                agent: false,
            },
            Speaker::Agent => Self {
                user: false,
                agent: speaking,
            },
        }
    }
}

/// Change published to observers after each transcription
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptUpdate {
    /// Position of the utterance in the log
    pub index: usize,
    pub utterance: Utterance,
    /// False when an existing utterance was extended
    pub created: bool,
}

/// In-memory transcript for the current session.
///
/// Fragments from the same sender are appended to the last utterance until
/// it is marked complete.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    utterances: Vec<Utterance>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &TranscriptionEvent) -> TranscriptUpdate {
        let now = Utc::now();
        let complete = event.finished == Some(true);

        let last_index = self.utterances.len().checked_sub(1);
        if let (Some(index), Some(last)) = (last_index, self.utterances.last_mut()) {
            if last.sender == event.sender && !last.complete {
                last.text.push_str(&event.text);
                last.complete = complete;
                last.updated_at = now;
                return TranscriptUpdate {
                    index,
                    utterance: last.clone(),
                    created: false,
                };
            }
        }

        let utterance = Utterance {
            sender: event.sender,
            text: event.text.clone(),
            complete,
            started_at: now,
            updated_at: now,
        };
        self.utterances.push(utterance.clone());
        TranscriptUpdate {
            index: self.utterances.len() - 1,
            utterance,
            created: true,
        }
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn clear(&mut self) {
        self.utterances.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sender: Speaker, text: &str, finished: Option<bool>) -> TranscriptionEvent {
        TranscriptionEvent {
            text: text.into(),
            sender,
            finished,
        }
    }

    #[test]
    fn fragments_coalesce_until_finished() {
        let mut log = TranscriptLog::new();
        assert!(log.apply(&event(Speaker::User, "Hello", Some(false))).created);
        let update = log.apply(&event(Speaker::User, " there", None));
        assert!(!update.created);
        assert_eq!(update.utterance.text, "Hello there");

        log.apply(&event(Speaker::User, "!", Some(true)));
        assert_eq!(log.len(), 1);
        assert!(log.utterances()[0].complete);

        let update = log.apply(&event(Speaker::User, "Again", Some(false)));
        assert!(update.created);
        assert_eq!(update.index, 1);
    }

    #[test]
    fn sender_change_starts_new_utterance() {
        let mut log = TranscriptLog::new();
        log.apply(&event(Speaker::User, "What's near me?", Some(false)));
        log.apply(&event(Speaker::Agent, "A museum", Some(false)));
        log.apply(&event(Speaker::Agent, " and a park.", Some(true)));

        let texts: Vec<_> = log.utterances().iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["What's near me?", "A museum and a park."]);
        assert!(!log.utterances()[0].complete);
    }

    #[test]
    fn appended_fragment_reports_its_index() {
        let mut log = TranscriptLog::new();
        log.apply(&event(Speaker::User, "Where am I?", Some(true)));
        log.apply(&event(Speaker::Agent, "You are", Some(false)));

        let update = log.apply(&event(Speaker::Agent, " in Rome.", Some(true)));
        assert!(!update.created);
        assert_eq!(update.index, 1);
        assert_eq!(update.utterance.text, "You are in Rome.");
        assert_eq!(log.utterances()[update.index].text, update.utterance.text);
    }

    #[test]
    fn speaking_flags_follow_latest_sender() {
        let flags = SpeakingFlags::after(&event(Speaker::User, "hi", Some(false)));
        assert_eq!(flags, SpeakingFlags { user: true, agent: false });

        let flags = SpeakingFlags::after(&event(Speaker::Agent, "hello", None));
        assert_eq!(flags, SpeakingFlags { user: false, agent: true });

        let flags = SpeakingFlags::after(&event(Speaker::Agent, "bye", Some(true)));
        assert_eq!(flags, SpeakingFlags::default());
    }
}
