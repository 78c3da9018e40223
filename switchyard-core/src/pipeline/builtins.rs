//! Built-in pipelines shipped with Switchyard.
//!
//! Each pipeline is defined as a YAML string constant that can be parsed
//! by the pipeline parser.

use crate::pipeline::parser::parse_pipeline;
use crate::pipeline::types::Pipeline;

/// Returns the ids of all built-in pipelines.
pub fn list_builtin_names() -> Vec<&'static str> {
    vec![
        "summarize",
        "translate",
        "describe_image",
        "transcribe_and_summarize",
    ]
}

/// Load a built-in pipeline by id.
pub fn get_builtin(name: &str) -> Option<Pipeline> {
    let yaml = match name {
        "summarize" => SUMMARIZE_PIPELINE,
        "translate" => TRANSLATE_PIPELINE,
        "describe_image" => DESCRIBE_IMAGE_PIPELINE,
        "transcribe_and_summarize" => TRANSCRIBE_AND_SUMMARIZE_PIPELINE,
        _ => return None,
    };
    parse_pipeline(yaml).ok()
}

/// Load all built-in pipelines.
pub fn all_builtins() -> Vec<Pipeline> {
    list_builtin_names()
        .into_iter()
        .filter_map(get_builtin)
        .collect()
}

const SUMMARIZE_PIPELINE: &str = r#"
id: summarize
name: Summarize
description: Condense a document into a short summary
systemPrompt: You are a precise assistant that writes faithful summaries.
outputFormat: markdown
inputs:
  - name: content
    type: textarea
    label: Text to summarize
    required: true
  - name: length
    type: select
    label: Length
    options: [short, medium, long]
    defaultValue: short
  - name: focus
    type: text
    label: Focus (optional)
steps:
  - name: summarize
    model: language
    input: $content
    prompt: >-
      Write a {{length}} summary of the following text.{{#if focus}}
      Pay particular attention to {{focus}}.{{/if}}
    output: summary
"#;

const TRANSLATE_PIPELINE: &str = r#"
id: translate
name: Translate
description: Translate text, then polish the result when requested
inputs:
  - name: text
    type: textarea
    label: Text
    required: true
  - name: language
    type: text
    label: Target language
    required: true
    defaultValue: English
  - name: polish
    type: toggle
    label: Polish the translation
    defaultValue: false
steps:
  - name: translate
    model: language
    input: $text
    prompt: "Translate the following text into {{language}}. Reply with the translation only.\n\n{{text}}"
    output: translation
  - name: polish
    model: language
    input: $translation
    prompt: "Improve the fluency of this {{language}} text without changing its meaning:\n\n{{translation}}"
    output: polished
    condition:
      check: $polish
      operator: equals
      value: "true"
      action: continue
"#;

const DESCRIBE_IMAGE_PIPELINE: &str = r#"
id: describe_image
name: Describe Image
description: Caption an image and expand it into a description
inputs:
  - name: image
    type: file
    label: Image
    accepts: "image/*"
    required: true
  - name: audience
    type: text
    label: Audience (optional)
steps:
  - name: caption
    model: vision
    input: $image
    prompt: Describe this image in one sentence.
    output: caption
  - name: describe
    model: language
    input: $caption
    prompt: >-
      Expand this image caption into a short paragraph{{#if audience}} written
      for {{audience}}{{/if}}: {{caption}}
    output: description
    condition:
      check: $caption
      operator: not_empty
      action: continue
"#;

const TRANSCRIBE_AND_SUMMARIZE_PIPELINE: &str = r#"
id: transcribe_and_summarize
name: Transcribe and Summarize
description: Transcribe a recording and summarize what was said
outputFormat: markdown
inputs:
  - name: audio
    type: file
    label: Recording
    accepts: "audio/*"
    required: true
steps:
  - name: transcribe
    model: audio
    input: $audio
    output: transcript
  - name: stop_if_silent
    model: language
    input: $transcript
    output: silence_note
    condition:
      check: $transcript
      operator: empty
      action: stop
  - name: summarize
    model: language
    input: $transcript
    prompt: "Summarize this transcript as bullet points:\n\n{{transcript}}"
    output: summary
"#;
