use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Placeholder replaced with the source file path in transcoder arguments
pub const FILE_PLACEHOLDER: &str = "$FILE";

/// External program that writes the converted audio to stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcoder {
    pub program: String,
    pub args: Vec<String>,
}

impl Transcoder {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Command line for one source file; stdout is piped and the child dies with its handle
    pub fn command_for(&self, source: &Path) -> Command {
        let mut command = Command::new(&self.program);
        for arg in &self.args {
            if arg == FILE_PLACEHOLDER {
                command.arg(source);
            } else {
                command.arg(arg);
            }
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProfile {
    pub mime: String,
    /// Format byte carried in `strm` start frames
    pub format_tag: u8,
    pub transcoder: Option<Transcoder>,
}

impl FormatProfile {
    pub fn direct(mime: &str, format_tag: u8) -> Self {
        Self {
            mime: mime.to_string(),
            format_tag,
            transcoder: None,
        }
    }

    pub fn transcoded(mime: &str, format_tag: u8, transcoder: Transcoder) -> Self {
        Self {
            mime: mime.to_string(),
            format_tag,
            transcoder: Some(transcoder),
        }
    }
}

/// Extension to profile table, fixed once the server starts
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    profiles: HashMap<String, FormatProfile>,
}

static BUILTIN: Lazy<FormatRegistry> = Lazy::new(FormatRegistry::standard);

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared instance of the standard table
    pub fn builtin() -> &'static FormatRegistry {
        &BUILTIN
    }

    pub fn standard() -> Self {
        // DSD is sent to the device as DoP-in-FLAC
        let dop = Transcoder::new(
            "sox",
            &[FILE_PLACEHOLDER, "-b", "24", "-r", "176.4k", "-C", "0", "-t", "flac", "-", "dop"],
        );
        let wav = Transcoder::new("sox", &[FILE_PLACEHOLDER, "-C", "0", "-t", "flac", "-"]);

        Self::new()
            .with("flac", FormatProfile::direct("audio/x-flac", b'f'))
            .with("mp3", FormatProfile::direct("audio/mpeg", b'm'))
            .with("ogg", FormatProfile::direct("audio/ogg", b'o'))
            .with("dsf", FormatProfile::transcoded("audio/x-flac", b'f', dop.clone()))
            .with("dff", FormatProfile::transcoded("audio/x-flac", b'f', dop))
            .with("wav", FormatProfile::transcoded("audio/x-flac", b'f', wav))
    }

    pub fn with(mut self, extension: &str, profile: FormatProfile) -> Self {
        self.profiles.insert(extension.to_ascii_lowercase(), profile);
        self
    }

    /// Profile for the path's extension, compared case-insensitively
    pub fn lookup(&self, path: &Path) -> Option<&FormatProfile> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        self.profiles.get(&extension)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let formats = FormatRegistry::builtin();

        let flac = formats.lookup(Path::new("/music/a.flac")).unwrap();
        assert_eq!(flac.mime, "audio/x-flac");
        assert_eq!(flac.format_tag, b'f');
        assert!(flac.transcoder.is_none());

        let mp3 = formats.lookup(Path::new("/music/b.MP3")).unwrap();
        assert_eq!(mp3.format_tag, b'm');

        let dsf = formats.lookup(Path::new("/music/c.dsf")).unwrap();
        assert_eq!(dsf.transcoder.as_ref().unwrap().program, "sox");

        assert!(formats.lookup(Path::new("/music/notes.txt")).is_none());
        assert!(formats.lookup(Path::new("/music/no_extension")).is_none());
    }

    #[test]
    fn test_placeholder_substitution() {
        let transcoder = Transcoder::new("sox", &[FILE_PLACEHOLDER, "-t", "flac", "-"]);
        let command = transcoder.command_for(Path::new("/music/c.dsf"));
        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args, ["/music/c.dsf", "-t", "flac", "-"]);
        assert_eq!(command.as_std().get_program(), "sox");
    }
}
