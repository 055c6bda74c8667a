use crate::{HistoryEntry, Transcript};

/// Selects the dialogue for one level: player and engine turns tagged `level`, in
/// insertion order. Narrator turns and other levels never reach the engine.
pub fn scope_history(transcript: &Transcript, level: u32) -> Vec<HistoryEntry> {
    transcript
        .iter()
        .filter(|turn| turn.level == level)
        .filter_map(|turn| {
            turn.speaker.conversational().map(|speaker| HistoryEntry {
                speaker,
                text: turn.text.clone(),
            })
        })
        .collect()
}
