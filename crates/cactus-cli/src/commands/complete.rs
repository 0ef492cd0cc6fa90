//! Complete command - run one completion through the engine

use anyhow::{bail, Context, Result};
use cactus_bridge::payload::messages_json;
use cactus_bridge::{
    ChatMessage, ClosureEnv, CompletionOptions, CompletionRequest, CompletionResult,
    CompletionStatus, EngineApi, LibraryLoader, Model, ResponseBuffer, TokenCallback, TokenSink,
};
use cactus_config::Config;
use std::cell::RefCell;
use std::io::{self, Write};

/// Arguments for `cactus complete`; `None` falls back to configuration
pub struct CompleteArgs {
    pub model: String,
    pub prompt: Option<String>,
    pub messages: Option<String>,
    pub options: Option<String>,
    pub tools: Option<String>,
    pub buffer_size: Option<usize>,
    pub context_size: Option<u32>,
    pub stream: bool,
    pub raw: bool,
}

pub fn run(args: CompleteArgs, config: &Config) -> Result<()> {
    let messages = match (args.messages, args.prompt) {
        (Some(messages), _) => require_json("--messages", messages)?,
        (None, Some(prompt)) => messages_json(&[ChatMessage::user(prompt)])?,
        (None, None) => bail!("Either --prompt or --messages is required"),
    };
    let options = match args.options {
        Some(options) => require_json("--options", options)?,
        None => CompletionOptions::from_config(config).options_json()?,
    };
    let tools = args.tools.map(|t| require_json("--tools", t)).transpose()?;

    let buffer_size = args.buffer_size.unwrap_or_else(|| config.buffer_size());
    if buffer_size == 0 {
        bail!("--buffer-size must be greater than 0");
    }
    let context_size = args.context_size.unwrap_or_else(|| config.context_size()) as usize;

    let mut loader = LibraryLoader::with_search_paths(config.search_paths().iter().cloned());
    let api = EngineApi::load(&mut loader, config.engine_library()).with_context(|| {
        format!("Failed to load engine library '{}'", config.engine_library())
    })?;

    let mut model = Model::create(&api, &args.model, context_size)?;

    let mut request = CompletionRequest::new(&messages).with_options(&options);
    if let Some(tools) = tools.as_deref() {
        request = request.with_tools(tools);
    }

    let sink: &TokenSink<'_> = &RefCell::new(|text: &str, _token_id: u32| {
        let mut out = io::stdout().lock();
        // a closed stdout only loses the live view; the buffer still has the text
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    });
    let mut env = ClosureEnv::new();
    let callback = if args.stream {
        TokenCallback::bind(&mut env, Some(&sink))
    } else {
        TokenCallback::Absent
    };

    let mut region = vec![0u8; buffer_size];
    let mut buffer = ResponseBuffer::new(&mut region);
    let outcome = model.complete_streaming(&request, &mut buffer, callback)?;
    model.destroy();

    if args.stream {
        println!();
    }

    match outcome.status {
        CompletionStatus::Failed { code } => bail!("Engine failed with code {}", code),
        CompletionStatus::Truncated { written, required } => {
            eprintln!(
                "warning: response truncated to {} of {} bytes; raise --buffer-size",
                written, required
            );
        }
        CompletionStatus::Complete { .. } => {}
    }

    tracing::info!(
        received = outcome.events.received,
        faulted = outcome.events.faulted,
        "Completion finished"
    );

    let text = outcome.text.unwrap_or_default();
    if args.raw {
        println!("{}", text);
        return Ok(());
    }

    match CompletionResult::parse(&text) {
        Ok(result) => {
            if !args.stream {
                println!("{}", result.response);
            }
            tracing::info!(
                total_tokens = result.total_tokens,
                tokens_per_second = result.tokens_per_second,
                "Response parsed"
            );
            if !result.success {
                bail!("Engine reported an unsuccessful completion");
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "Response is not a JSON document; printing raw text");
            if !args.stream {
                println!("{}", text);
            }
        }
    }

    Ok(())
}

fn require_json(flag: &str, text: String) -> Result<String> {
    serde_json::from_str::<serde_json::Value>(&text)
        .with_context(|| format!("{} is not valid JSON", flag))?;
    Ok(text)
}
