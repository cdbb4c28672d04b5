//! Instructions sent to the extraction and verification models.
//!
//! Kept in one place so prompt changes never touch retry logic and so tests
//! can assert on the wording directly.

/// Instruction for the vision model that transcribes one slide image.
pub const EXTRACTION_PROMPT: &str = r#"You are transcribing a single slide of a startup pitch deck into plain text for an investment analyst.

Follow these rules precisely:

1. TITLES
   - Reproduce the slide title and any subtitle verbatim on their own lines.

2. BODY TEXT
   - Transcribe every piece of readable text in natural reading order.
   - Keep bullet structure with "- " prefixes.

3. CHARTS, DIAGRAMS AND LOGOS
   - Describe what each chart, diagram, or logo shows and how it relates to the
     surrounding text (axes, values, trend, which company a logo belongs to).

4. TABLES
   - Render tables as Markdown pipe tables with a header row.

5. WHAT TO IGNORE
   - Background imagery and decorative shapes.
   - Watermarks, "confidential" stamps, and page numbers.

6. OUTPUT FORMAT
   - Output only the transcription. No preamble, no commentary.
   - Do not wrap the output in code fences."#;

/// Token the verifier must answer with when the transcription is usable.
pub const VERIFICATION_CLEAN_SIGNAL: &str = "NO_ISSUES";

/// Instruction for the text model that checks an extraction.
pub const VERIFICATION_PROMPT: &str = r#"You review the output of a model that was asked to transcribe a slide image.

Decide whether the model explicitly refused, or announced that it could not see, read, open, or process the image (for example "I'm sorry, I can't help with that", "the image is not visible", "I am unable to read this slide").

- If it did NOT refuse and the output is a genuine transcription, answer with exactly: NO_ISSUES
- Otherwise answer with one short sentence describing what went wrong.

Do not judge style, completeness of numbers, or formatting. Only refusals and inability statements count."#;

/// Build the user turn for the verifier around an extraction.
pub fn verification_input(extracted: &str) -> String {
    format!("Transcription to review:\n\n\"\"\"{extracted}\"\"\"")
}
