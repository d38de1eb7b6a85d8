// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Mapping between Ollama-shaped requests/responses and the native backend
//! protocol. Pure functions; no i/o.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::native::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
    NativeMessage, Timings, Usage,
};
use crate::ollama::{
    ChatMessage, ChatRequest, ChatResponse, GenerateRequest, GenerateResponse, Metrics, Options,
};

/// Timestamp in the format ollama clients expect (`2024-05-01T12:00:00.123Z`).
pub fn created_at() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Backend timings are milliseconds (fractional); ollama reports nanoseconds.
pub fn ms_to_ns(ms: f64) -> u64 {
    if !ms.is_finite() || ms <= 0.0 {
        return 0;
    }
    (ms * 1_000_000.0).round() as u64
}

fn opt_f64(options: Option<&Options>, name: &str) -> Option<f64> {
    options.and_then(|o| o.get(name)).and_then(Value::as_f64)
}

fn opt_i64(options: Option<&Options>, name: &str) -> Option<i64> {
    options.and_then(|o| o.get(name)).and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
    })
}

/// `stop` may be a single string or a list of strings.
fn opt_stop(options: Option<&Options>) -> Vec<String> {
    match options.and_then(|o| o.get("stop")) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// `/api/generate` -> `/completion`.
pub fn generate_to_native(req: &GenerateRequest) -> CompletionRequest {
    let options = req.options.as_ref();
    CompletionRequest {
        prompt: req.prompt.clone(),
        stream: req.wants_stream(),
        system_prompt: req.system.clone().filter(|s| !s.is_empty()),
        temperature: opt_f64(options, "temperature"),
        top_p: opt_f64(options, "top_p"),
        top_k: opt_i64(options, "top_k"),
        n_predict: opt_i64(options, "num_predict"),
        repeat_penalty: opt_f64(options, "repeat_penalty"),
        seed: opt_i64(options, "seed"),
        stop: opt_stop(options),
    }
}

/// `/api/chat` -> `/v1/chat/completions`.
pub fn chat_to_native(req: &ChatRequest) -> ChatCompletionRequest {
    let options = req.options.as_ref();
    ChatCompletionRequest {
        messages: req
            .messages
            .iter()
            .map(|m| NativeMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect(),
        stream: req.wants_stream(),
        temperature: opt_f64(options, "temperature"),
        top_p: opt_f64(options, "top_p"),
        top_k: opt_i64(options, "top_k"),
        max_tokens: opt_i64(options, "num_predict"),
        seed: opt_i64(options, "seed"),
        stop: opt_stop(options),
    }
}

/// Token counts and durations from backend timings.
pub fn metrics_from_timings(timings: Option<&Timings>) -> Metrics {
    let Some(t) = timings else {
        return Metrics::default();
    };
    let prompt_ns = t.prompt_ms.map(ms_to_ns);
    let eval_ns = t.predicted_ms.map(ms_to_ns);
    let total = match (prompt_ns, eval_ns) {
        (None, None) => None,
        (p, e) => Some(p.unwrap_or(0) + e.unwrap_or(0)),
    };
    Metrics {
        total_duration: total,
        load_duration: None,
        prompt_eval_count: t.prompt_n,
        prompt_eval_duration: prompt_ns,
        eval_count: t.predicted_n,
        eval_duration: eval_ns,
    }
}

/// Chat metrics prefer backend timings and fall back to openai-style usage.
pub fn chat_metrics(timings: Option<&Timings>, usage: Option<&Usage>) -> Metrics {
    let mut metrics = metrics_from_timings(timings);
    if let Some(usage) = usage {
        metrics.prompt_eval_count = metrics.prompt_eval_count.or(usage.prompt_tokens);
        metrics.eval_count = metrics.eval_count.or(usage.completion_tokens);
    }
    metrics
}

fn completion_done_reason(resp: &CompletionResponse) -> String {
    match resp.stop_type.as_deref() {
        Some("limit") => "length".to_string(),
        _ => "stop".to_string(),
    }
}

/// Buffered `/completion` response -> final `/api/generate` object.
pub fn completion_to_generate(model: &str, resp: &CompletionResponse) -> GenerateResponse {
    GenerateResponse {
        model: model.to_string(),
        created_at: created_at(),
        response: resp.content.clone(),
        done: true,
        done_reason: Some(completion_done_reason(resp)),
        context: None,
        metrics: metrics_from_timings(resp.timings.as_ref()),
    }
}

/// One streamed `/completion` chunk -> intermediate `/api/generate` object.
pub fn completion_chunk(model: &str, content: &str) -> GenerateResponse {
    GenerateResponse {
        model: model.to_string(),
        created_at: created_at(),
        response: content.to_string(),
        done: false,
        done_reason: None,
        context: None,
        metrics: Metrics::default(),
    }
}

/// Terminal `/api/generate` object of a stream.
pub fn generate_terminal(model: &str, last: Option<&CompletionResponse>) -> GenerateResponse {
    GenerateResponse {
        model: model.to_string(),
        created_at: created_at(),
        response: String::new(),
        done: true,
        done_reason: Some(last.map(completion_done_reason).unwrap_or_else(|| "stop".into())),
        context: None,
        metrics: metrics_from_timings(last.and_then(|l| l.timings.as_ref())),
    }
}

fn chat_done_reason(resp: &ChatCompletionResponse) -> String {
    resp.finish_reason().unwrap_or("stop").to_string()
}

/// Buffered chat completion -> final `/api/chat` object.
pub fn chat_completion_to_chat(model: &str, resp: &ChatCompletionResponse) -> ChatResponse {
    ChatResponse {
        model: model.to_string(),
        created_at: created_at(),
        message: ChatMessage::assistant(resp.first_content()),
        done: true,
        done_reason: Some(chat_done_reason(resp)),
        metrics: chat_metrics(resp.timings.as_ref(), resp.usage.as_ref()),
    }
}

pub fn chat_chunk(model: &str, content: &str) -> ChatResponse {
    ChatResponse {
        model: model.to_string(),
        created_at: created_at(),
        message: ChatMessage::assistant(content),
        done: false,
        done_reason: None,
        metrics: Metrics::default(),
    }
}

pub fn chat_terminal(model: &str, last: Option<&ChatCompletionResponse>) -> ChatResponse {
    ChatResponse {
        model: model.to_string(),
        created_at: created_at(),
        message: ChatMessage::assistant(""),
        done: true,
        done_reason: Some(last.map(chat_done_reason).unwrap_or_else(|| "stop".into())),
        metrics: last
            .map(|l| chat_metrics(l.timings.as_ref(), l.usage.as_ref()))
            .unwrap_or_default(),
    }
}
