//! Pipeline timing: a zero-allocation record of named marks for one
//! chat/voice request, reported as ms-relative-to-t0 and as a single-line
//! log. `tracing` spans cover general observability; this is the narrower
//! purpose-built structure the `chat:timing` event payload is built from.

use std::time::Instant;

/// Named marks in the order they can occur during one request. `t5`/`t6`/
/// `t7` are optional — a text-only reply never touches the TTS pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Received,
    Routed,
    LlmStart,
    FirstToken,
    LlmDone,
    TtsQueued,
    TtsFirst,
    AudioDelivered,
}

impl Mark {
    fn label(self) -> &'static str {
        match self {
            Mark::Received => "t0_received",
            Mark::Routed => "t1_routed",
            Mark::LlmStart => "t2_llm_start",
            Mark::FirstToken => "t3_first_token",
            Mark::LlmDone => "t4_llm_done",
            Mark::TtsQueued => "t5_tts_queued",
            Mark::TtsFirst => "t6_tts_first",
            Mark::AudioDelivered => "t7_audio_delivered",
        }
    }
}

const SLOT_COUNT: usize = 8;

fn slot(mark: Mark) -> usize {
    match mark {
        Mark::Received => 0,
        Mark::Routed => 1,
        Mark::LlmStart => 2,
        Mark::FirstToken => 3,
        Mark::LlmDone => 4,
        Mark::TtsQueued => 5,
        Mark::TtsFirst => 6,
        Mark::AudioDelivered => 7,
    }
}

/// Records marks for a single request against a fixed `t0`. Mark storage is
/// a fixed-size array of `Option<Instant>`, not a growable map, per spec's
/// "zero-allocation record of named marks".
pub struct PipelineTimer {
    t0: Instant,
    marks: [Option<Instant>; SLOT_COUNT],
}

impl PipelineTimer {
    pub fn start() -> Self {
        Self {
            t0: Instant::now(),
            marks: [None; SLOT_COUNT],
        }
    }

    pub fn mark(&mut self, mark: Mark) {
        self.marks[slot(mark)].get_or_insert_with(Instant::now);
    }

    fn ms(&self, mark: Mark) -> Option<u64> {
        self.marks[slot(mark)].map(|t| t.saturating_duration_since(self.t0).as_millis() as u64)
    }

    /// ms-relative-to-t0 breakdown, one entry per mark that was actually hit.
    pub fn breakdown(&self) -> Vec<(&'static str, u64)> {
        [
            Mark::Received,
            Mark::Routed,
            Mark::LlmStart,
            Mark::FirstToken,
            Mark::LlmDone,
            Mark::TtsQueued,
            Mark::TtsFirst,
            Mark::AudioDelivered,
        ]
        .into_iter()
        .filter_map(|m| self.ms(m).map(|ms| (m.label(), ms)))
        .collect()
    }

    /// Total elapsed time as of now, not as of the last mark — a request can
    /// still be draining TTS chunks after `LlmDone`.
    pub fn total_ms(&self) -> u64 {
        self.t0.elapsed().as_millis() as u64
    }

    /// The single-line `[Timing] route=… first_token=… tts_first=… total=…`
    /// log emitted once per request.
    pub fn log_line(&self) -> String {
        format!(
            "[Timing] route={} first_token={} tts_first={} total={}",
            fmt_ms(self.ms(Mark::Routed)),
            fmt_ms(self.ms(Mark::FirstToken)),
            fmt_ms(self.ms(Mark::TtsFirst)),
            self.total_ms(),
        )
    }

    /// JSON payload for the `chat:timing` event.
    pub fn to_event_payload(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (label, ms) in self.breakdown() {
            obj.insert(label.to_owned(), serde_json::json!(ms));
        }
        obj.insert("total_ms".to_owned(), serde_json::json!(self.total_ms()));
        serde_json::Value::Object(obj)
    }
}

fn fmt_ms(ms: Option<u64>) -> String {
    ms.map(|v| v.to_string()).unwrap_or_else(|| "-".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn breakdown_only_includes_hit_marks() {
        let mut timer = PipelineTimer::start();
        timer.mark(Mark::Received);
        timer.mark(Mark::Routed);
        let breakdown = timer.breakdown();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].0, "t0_received");
        assert_eq!(breakdown[1].0, "t1_routed");
    }

    #[test]
    fn marks_are_monotonic_and_idempotent() {
        let mut timer = PipelineTimer::start();
        timer.mark(Mark::Received);
        sleep(Duration::from_millis(5));
        let first = timer.ms(Mark::Received);
        timer.mark(Mark::Received);
        assert_eq!(timer.ms(Mark::Received), first, "re-marking must not move the timestamp");
    }

    #[test]
    fn text_only_reply_omits_tts_marks() {
        let mut timer = PipelineTimer::start();
        timer.mark(Mark::Received);
        timer.mark(Mark::Routed);
        timer.mark(Mark::LlmStart);
        timer.mark(Mark::FirstToken);
        timer.mark(Mark::LlmDone);
        let labels: Vec<_> = timer.breakdown().into_iter().map(|(l, _)| l).collect();
        assert!(!labels.contains(&"t5_tts_queued"));
    }

    #[test]
    fn log_line_uses_dash_for_missing_marks() {
        let timer = PipelineTimer::start();
        assert!(timer.log_line().contains("route=-"));
    }

    #[test]
    fn event_payload_includes_total_ms() {
        let timer = PipelineTimer::start();
        let payload = timer.to_event_payload();
        assert!(payload.get("total_ms").is_some());
    }
}
