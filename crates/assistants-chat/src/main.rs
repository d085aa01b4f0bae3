//! Sends one message to an assistant and streams the reply.

mod chat;
mod speech;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use assistants_stream::{
    ApiError, AssistantsClient, AssistantsConfig, NarrationMode, Narrator, PlaybackQueue, Role,
    Run, RunOptions, RunStatus, SortOrder, Transcript, TranscriptionOptions, Voice, init_observability,
};
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn};

use crate::chat::{ChatTurn, OutputMode, drive_run};
use crate::speech::{ClientSynthesizer, FileStreamingPlayer, SpeechDir};

#[derive(Debug, Parser)]
#[command(name = "assistants-chat", version, about)]
struct Cli {
    /// Message to send.
    #[arg(required_unless_present = "audio")]
    message: Option<String>,
    /// Transcribe this audio file and send its text as the message.
    #[arg(long, conflicts_with = "message")]
    audio: Option<PathBuf>,
    /// Language hint for the transcription (ISO-639-1).
    #[arg(long, requires = "audio")]
    language: Option<String>,
    /// Instructions appended to the assistant's own for this run.
    #[arg(long)]
    instructions: Option<String>,
    /// Start the run without streaming and poll it until it finishes.
    #[arg(long)]
    poll: bool,
    /// Existing thread to continue; a new thread is created otherwise.
    #[arg(long)]
    thread: Option<String>,
    /// Assistant to run (overrides OPENAI_ASSISTANT_ID).
    #[arg(long)]
    assistant: Option<String>,
    /// API base URL (overrides OPENAI_BASE_URL).
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, value_enum, default_value_t = OutputMode::Json)]
    mode: OutputMode,
    /// Save narration as .mp3 files in this directory.
    #[arg(long)]
    speech_dir: Option<PathBuf>,
    /// Synthesize whole clips instead of streaming speech.
    #[arg(long)]
    rendered_speech: bool,
    /// Voice for narration (overrides OPENAI_SPEECH_VOICE).
    #[arg(long)]
    voice: Option<String>,
}

impl Cli {
    fn apply(&self, mut config: AssistantsConfig) -> Result<AssistantsConfig, Box<dyn std::error::Error>> {
        if let Some(assistant) = &self.assistant {
            config = config.assistant_id(assistant.clone());
        }
        if let Some(base_url) = &self.base_url {
            config = config.base_url(base_url.clone());
        }
        if let Some(voice) = &self.voice {
            config = config.voice(voice.parse::<Voice>()?);
        }
        Ok(config)
    }

    fn run_options(&self) -> RunOptions {
        match &self.instructions {
            Some(instructions) => RunOptions::new().additional_instructions(instructions.clone()),
            None => RunOptions::new(),
        }
    }

    fn transcription_options(&self) -> TranscriptionOptions {
        TranscriptionOptions {
            language: self.language.clone(),
            ..TranscriptionOptions::default()
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Returns the text to send, transcribing `--audio` when given.
async fn user_text(cli: &Cli, client: &AssistantsClient) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(message) = &cli.message {
        return Ok(message.clone());
    }
    let Some(path) = &cli.audio else {
        return Err("either a message or --audio is required".into());
    };
    let audio = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("audio.wav");
    let transcription = client
        .create_transcription(Bytes::from(audio), file_name, &cli.transcription_options())
        .await?;
    eprintln!("heard: {}", transcription.text);
    Ok(transcription.text)
}

/// Creates a run and polls it until it ends or asks for tool outputs,
/// which this client does not provide.
async fn poll_run(
    client: &AssistantsClient,
    thread_id: &str,
    options: &RunOptions,
) -> Result<Run, ApiError> {
    let mut run = client.create_run(thread_id, options).await?;
    while !run.status.is_terminal() && run.status != RunStatus::RequiresAction {
        tokio::time::sleep(POLL_INTERVAL).await;
        run = client.get_run(thread_id, &run.id).await?;
    }
    info!(run_id = %run.id, status = ?run.status, "run finished");
    Ok(run)
}

/// Load .env from the crate dir or the current dir.
fn load_env() {
    if let Ok(canon) = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join(".env")
        .canonicalize()
    {
        let _ = dotenvy::from_path(canon);
    }
    let _ = dotenvy::dotenv();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env();
    init_observability();
    let cli = Cli::parse();

    let config = cli.apply(AssistantsConfig::from_env()?)?;
    let client = AssistantsClient::new(config)?;
    let thread_id = match &cli.thread {
        Some(id) => id.clone(),
        None => client.create_thread().await?.id,
    };
    eprintln!("thread: {thread_id}");

    let mut narrator = match &cli.speech_dir {
        Some(dir) => {
            let dir = SpeechDir::create(dir)?;
            eprintln!("speech files: {}", dir.path().display());
            let queue = PlaybackQueue::new(Arc::new(FileStreamingPlayer::new(dir.clone())));
            let synthesizer = Arc::new(ClientSynthesizer::new(client.clone(), dir));
            let mode = if cli.rendered_speech {
                NarrationMode::Rendered
            } else {
                NarrationMode::Streaming
            };
            Some(Narrator::new(synthesizer, queue).with_mode(mode))
        }
        None => None,
    };

    let text = user_text(&cli, &client).await?;
    let mut transcript = Transcript::new();
    transcript.push_user(text.clone());
    client.create_message(&thread_id, Role::User, &text).await?;

    let options = cli.run_options();
    let mut out = std::io::stdout();
    {
        let mut turn = ChatTurn::new(cli.mode, &mut transcript, narrator.as_mut());
        if cli.poll {
            let run = poll_run(&client, &thread_id, &options).await?;
            if let Some(error) = run.last_error {
                warn!(run_id = %run.id, reason = %error.message, "run did not complete");
            }
        } else {
            let events = client.create_run_stream(&thread_id, &options).await?;
            drive_run(events, &mut turn, &mut out).await?;
        }

        match client.list_messages(&thread_id, 1, SortOrder::Desc).await {
            Ok(messages) => {
                if let Some(text) = messages.first().and_then(|m| m.text()) {
                    turn.apply_final(text, &mut out)?;
                }
            }
            Err(err) => warn!(error = %err, "failed to fetch the final message"),
        }
    }

    if let Some(narrator) = &narrator {
        narrator.wait_idle().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_configuration() {
        let cli = Cli::parse_from([
            "assistants-chat",
            "hello",
            "--assistant",
            "asst_cli",
            "--voice",
            "onyx",
            "--mode",
            "plain",
        ]);
        assert_eq!(cli.mode, OutputMode::Plain);
        let config = cli
            .apply(AssistantsConfig::new("k").assistant_id("asst_env"))
            .expect("config");
        assert_eq!(config.assistant_id.as_deref(), Some("asst_cli"));
        assert_eq!(config.voice, Voice::Onyx);
    }

    #[test]
    fn audio_input_replaces_the_message() {
        let cli = Cli::parse_from([
            "assistants-chat",
            "--audio",
            "question.m4a",
            "--language",
            "en",
            "--instructions",
            "Be brief.",
            "--poll",
        ]);
        assert!(cli.message.is_none());
        assert!(cli.poll);
        assert_eq!(cli.transcription_options().language.as_deref(), Some("en"));
        assert_eq!(
            cli.run_options().additional_instructions.as_deref(),
            Some("Be brief.")
        );

        assert!(Cli::try_parse_from(["assistants-chat"]).is_err());
        assert!(Cli::try_parse_from(["assistants-chat", "hi", "--audio", "a.wav"]).is_err());
        assert!(Cli::try_parse_from(["assistants-chat", "hi", "--language", "en"]).is_err());
    }

    #[test]
    fn unknown_voice_is_rejected() {
        let cli = Cli::parse_from(["assistants-chat", "hi", "--voice", "robot"]);
        assert!(cli.apply(AssistantsConfig::new("k")).is_err());
    }
}
