//! Files the pipeline leaves between stages.
//!
//! ```text
//! <cache>/<stem>/<stem>.srt                        recognised subtitles
//! <cache>/<stem>/audio_segments.json               segments, later the merge manifest
//! <output>/<stem>/<stem>_segments/batch_tasks.json synthesis tasks
//! <output>/<stem>/<stem>_segments/segment_<i>.wav  synthesised audio
//! <output>/<stem>/<stem>_dubbed_<lang>.mp4         merged video
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::segment::Segment;

/// `HH:MM:SS,mmm` for `seconds`.  Negative times clamp to zero.
///
/// ```
/// use dubbing_pipeline::pipeline::format_srt_time;
///
/// assert_eq!(format_srt_time(0.0), "00:00:00,000");
/// assert_eq!(format_srt_time(3723.5), "01:02:03,500");
/// ```
pub fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let s = total_secs % 60;
    let m = (total_secs / 60) % 60;
    let h = total_secs / 3600;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

/// Render segments as SRT, numbered from 1.
pub fn to_srt(segments: &[Segment]) -> String {
    segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            format!(
                "{}\n{} --> {}\n{}\n",
                i + 1,
                format_srt_time(seg.start),
                format_srt_time(seg.end),
                seg.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

struct SrtPatterns {
    timing: Regex,
    timestamp_start: Regex,
}

fn srt_patterns() -> &'static SrtPatterns {
    static PATTERNS: OnceLock<SrtPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| SrtPatterns {
        timing: Regex::new(
            r"^\s*(\d{2}):(\d{2}):(\d{2})[,.](\d{3})\s*-->\s*(\d{2}):(\d{2}):(\d{2})[,.](\d{3})",
        )
        .expect("cue timing pattern is a valid regex"),
        timestamp_start: Regex::new(r"^\s*\d{2}:\d{2}[:.]").expect("timestamp pattern is a valid regex"),
    })
}

fn cue_seconds(caps: &regex::Captures<'_>, first: usize) -> f64 {
    let part = |i: usize| caps[first + i].parse::<f64>().unwrap_or(0.0);
    part(0) * 3600.0 + part(1) * 60.0 + part(2) + part(3) / 1000.0
}

/// A cue number followed by something that looks like a timing line.
fn starts_cue(lines: &[&str], at: usize, timestamp_start: &Regex) -> bool {
    let number = lines[at].trim();
    !number.is_empty()
        && number.bytes().all(|b| b.is_ascii_digit())
        && lines.get(at + 1).is_some_and(|next| timestamp_start.is_match(next))
}

/// Parse SRT text into segments.
///
/// Accepts `,` or `.` before the milliseconds and any line ending.  Cues
/// whose text is blank are skipped, and lines before the first timing line
/// are ignored.
///
/// ```
/// use dubbing_pipeline::pipeline::parse_srt;
///
/// let segments = parse_srt("1\r\n00:00:01.500 --> 00:00:02,000\r\nHello\r\n");
/// assert_eq!(segments.len(), 1);
/// assert_eq!(segments[0].start, 1.5);
/// assert_eq!(segments[0].text, "Hello");
/// ```
pub fn parse_srt(text: &str) -> Vec<Segment> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized.lines().collect();
    let patterns = srt_patterns();

    let mut segments = Vec::new();
    for (at, line) in lines.iter().enumerate() {
        let Some(caps) = patterns.timing.captures(line) else {
            continue;
        };
        let body_end = (at + 1..lines.len())
            .find(|&i| {
                patterns.timing.is_match(lines[i]) || starts_cue(&lines, i, &patterns.timestamp_start)
            })
            .unwrap_or(lines.len());
        let body = lines[at + 1..body_end].join("\n");
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        segments.push(Segment::new(cue_seconds(&caps, 1), cue_seconds(&caps, 5), body));
    }
    segments
}

/// Read and parse an SRT file.
pub fn read_srt(path: &Path) -> io::Result<Vec<Segment>> {
    Ok(parse_srt(&fs::read_to_string(path)?))
}

/// Artifact locations for one input video.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPaths {
    pub stem: String,
    /// `<cache>/<stem>`
    pub cache_dir: PathBuf,
    /// `<output>/<stem>`
    pub output_dir: PathBuf,
    /// `<output>/<stem>/<stem>_segments`
    pub segments_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(video: &Path, cache_root: &Path, output_root: &Path) -> Self {
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "video".to_string());
        let output_dir = output_root.join(&stem);
        Self {
            cache_dir: cache_root.join(&stem),
            segments_dir: output_dir.join(format!("{stem}_segments")),
            output_dir,
            stem,
        }
    }

    pub fn srt_path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.srt", self.stem))
    }

    pub fn segments_json(&self) -> PathBuf {
        self.cache_dir.join("audio_segments.json")
    }

    pub fn batch_tasks(&self) -> PathBuf {
        self.segments_dir.join("batch_tasks.json")
    }

    pub fn segment_audio(&self, index: usize) -> PathBuf {
        self.segments_dir.join(format!("segment_{index}.wav"))
    }

    pub fn merged_output(&self, lang: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_dubbed_{lang}.mp4", self.stem))
    }

    /// Subtitles plus the segment list after recognition.
    pub fn write_recognition(&self, segments: &[Segment]) -> io::Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        fs::write(self.srt_path(), to_srt(segments))?;
        write_pretty(&self.segments_json(), &segments)?;
        log::debug!(
            "pipeline: wrote {} and {}",
            self.srt_path().display(),
            self.segments_json().display()
        );
        Ok(())
    }

    /// Synthesis task list; segments without audio get `segment_<i>.wav`.
    pub fn write_batch_tasks(&self, segments: &[Segment]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.segments_dir)?;
        let tasks: Vec<Segment> = segments
            .iter()
            .enumerate()
            .map(|(i, seg)| {
                let mut task = seg.clone();
                if task.audio_path.as_deref().map_or(true, str::is_empty) {
                    task.audio_path = Some(self.segment_audio(i).to_string_lossy().into_owned());
                }
                task
            })
            .collect();
        let path = self.batch_tasks();
        write_pretty(&path, &tasks)?;
        Ok(path)
    }

    /// Merge manifest of the segments that have audio.  Returns the path and
    /// the number of entries.
    pub fn write_merge_manifest(&self, segments: &[Segment]) -> io::Result<(PathBuf, usize)> {
        #[derive(Serialize)]
        struct Entry<'a> {
            start: f64,
            end: f64,
            path: &'a str,
        }

        let entries: Vec<Entry<'_>> = segments
            .iter()
            .filter(|s| s.has_audio())
            .filter_map(|s| {
                s.audio_path.as_deref().map(|path| Entry {
                    start: s.start,
                    end: s.end,
                    path,
                })
            })
            .collect();

        fs::create_dir_all(&self.cache_dir)?;
        let path = self.segments_json();
        write_pretty(&path, &entries)?;
        Ok((path, entries.len()))
    }
}

fn write_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn session(dir: &Path) -> SessionPaths {
        SessionPaths::new(
            Path::new("/videos/talk.mp4"),
            &dir.join("cache"),
            &dir.join("out"),
        )
    }

    #[test]
    fn srt_time_rolls_over_units() {
        assert_eq!(format_srt_time(59.9994), "00:00:59,999");
        assert_eq!(format_srt_time(61.25), "00:01:01,250");
        assert_eq!(format_srt_time(-1.0), "00:00:00,000");
    }

    #[test]
    fn srt_blocks_are_numbered_and_blank_separated() {
        let srt = to_srt(&[Segment::new(0.0, 1.0, "a"), Segment::new(1.5, 2.0, "b")]);
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:01,000\na\n\n2\n00:00:01,500 --> 00:00:02,000\nb\n"
        );
    }

    #[test]
    fn written_srt_parses_back() {
        let segs = vec![Segment::new(0.0, 1.25, "first"), Segment::new(61.5, 63.0, "two\nlines")];
        assert_eq!(parse_srt(&to_srt(&segs)), segs);
    }

    #[test]
    fn srt_parser_accepts_crlf_and_dot_millis() {
        let text = "1\r\n00:00:01.000 --> 00:00:02.500\r\nHola\r\n\r\n2\r\n01:00:00,000 --> 01:00:01,000\r\nAdios\r\n";
        let segs = parse_srt(text);
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].start, segs[0].end), (1.0, 2.5));
        assert_eq!(segs[0].text, "Hola");
        assert_eq!(segs[1].start, 3600.0);
        assert_eq!(segs[1].text, "Adios");
    }

    #[test]
    fn srt_parser_skips_empty_and_malformed_cues() {
        let text = "\
garbage before the first cue

1
00:00:00,000 --> 00:00:01,000


2
00:00:01,000 -> 00:00:02,000
broken arrow

3
00:00:02,000 --> 00:00:03,000
kept
";
        let segs = parse_srt(text);
        assert_eq!(segs.len(), 1, "{segs:?}");
        assert_eq!(segs[0].text, "kept");
        assert_eq!(segs[0].start, 2.0);
        assert!(parse_srt("").is_empty());
        assert!(parse_srt("not a subtitle file").is_empty());
    }

    #[test]
    fn read_srt_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.srt");
        fs::write(&path, to_srt(&[Segment::new(0.0, 1.0, "a")])).unwrap();
        assert_eq!(read_srt(&path).unwrap(), vec![Segment::new(0.0, 1.0, "a")]);
        assert!(read_srt(&dir.path().join("missing.srt")).is_err());
    }

    #[test]
    fn session_layout() {
        let s = SessionPaths::new(Path::new("a/clip.mov"), Path::new("/c"), Path::new("/o"));
        assert_eq!(s.stem, "clip");
        assert_eq!(s.srt_path(), Path::new("/c/clip/clip.srt"));
        assert_eq!(s.segment_audio(3), Path::new("/o/clip/clip_segments/segment_3.wav"));
        assert_eq!(s.merged_output("French"), Path::new("/o/clip/clip_dubbed_French.mp4"));
    }

    #[test]
    fn recognition_writes_srt_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(dir.path());
        s.write_recognition(&[Segment::new(0.0, 1.0, "hi")]).unwrap();

        let srt = fs::read_to_string(s.srt_path()).unwrap();
        assert!(srt.contains("hi"));
        let json: Value = serde_json::from_str(&fs::read_to_string(s.segments_json()).unwrap()).unwrap();
        assert_eq!(json[0]["text"], "hi");
    }

    #[test]
    fn batch_tasks_default_audio_paths() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(dir.path());
        let mut segs = vec![Segment::new(0.0, 1.0, "a"), Segment::new(1.0, 2.0, "b")];
        segs[1].audio_path = Some("custom.wav".into());

        let path = s.write_batch_tasks(&segs).unwrap();
        let json: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert!(json[0]["audioPath"]
            .as_str()
            .unwrap()
            .ends_with("segment_0.wav"));
        assert_eq!(json[1]["audioPath"], "custom.wav");
    }

    #[test]
    fn manifest_only_lists_segments_with_audio() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(dir.path());
        let mut segs = vec![
            Segment::new(0.0, 1.0, "a"),
            Segment::new(1.0, 2.0, "b"),
            Segment::new(2.0, 3.0, "c"),
        ];
        segs[0].set_audio(Some("a.wav".into()), true);
        segs[2].set_audio(Some("c.wav".into()), false);

        let (path, count) = s.write_merge_manifest(&segs).unwrap();
        assert_eq!(count, 1);
        let json: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!([{"start": 0.0, "end": 1.0, "path": "a.wav"}]));
    }
}
