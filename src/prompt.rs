/// Sentinels the inference provider is instructed to wrap its answer in.
pub const ANSWER_START: &str = "[STARTANSWER]";
pub const ANSWER_END: &str = "[ENDANSWER]";

/// Fixed instructions for the `Sample` builtin.
///
/// The delimiters make extraction independent of whatever else the model says
/// around the answer.
pub fn sample_instructions() -> String {
    format!(
        "Respond to this question in HTML format. Wrap the HTML in tags so that the final \
response looks like this:\n{ANSWER_START}\n<HTML formatted answer to the question goes here>\n{ANSWER_END}\n\n\
The HTML provided between the {ANSWER_START} and {ANSWER_END} tags will be inserted into an \
existing <DIV> block.\n"
    )
}

/// Extract the text strictly between the first start marker and the first
/// end marker that follows it. Leading whitespace after the start marker is
/// stripped; anything outside the markers is discarded.
pub fn extract_answer(raw: &str) -> Option<String> {
    let after_start = &raw[raw.find(ANSWER_START)? + ANSWER_START.len()..];
    let after_start = after_start.trim_start();
    let end = after_start.find(ANSWER_END)?;
    Some(after_start[..end].to_string())
}

/// Fallback answer when the model violated the delimiter format.
///
/// Embeds the raw response so nothing the model said is lost; a format
/// violation never aborts the run.
pub fn fallback_answer(raw: &str) -> String {
    format!("The language model was unable to provide an answer to the question [{raw}].")
}

/// Render the builtin-function listing appended to the capability docs.
pub fn builtins_docs(prefix: &str) -> String {
    format!(
        "Built in functions:\n\
Function: {prefix}.Output\n\
\tDescription: Sends a result to the user. Use this instead of print().\n\
\tParameters: output_string: string\n\
\tReturns: None\n\
Function: {prefix}.Sample\n\
\tDescription: Asks the language model directly when no library function can answer the question.\n\
\tParameters: question: string\n\
\tReturns: string\n\
Function: {prefix}.Wait\n\
\tDescription: Waits for a group of capability calls started earlier. Assign each call to a \
variable first and pass the variables as parameters; do not use any other gathering construct.\n\
\tParameters: calls: started capability calls\n\
\tReturns: array of results in parameter order\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_between_first_marker_pair() {
        let raw = format!("preamble {ANSWER_START}\n  <p>hi</p>{ANSWER_END} trailing {ANSWER_END}");
        assert_eq!(extract_answer(&raw).as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn extraction_fails_without_end_marker() {
        let raw = format!("{ANSWER_START} unterminated");
        assert_eq!(extract_answer(&raw), None);
    }

    #[test]
    fn extraction_fails_when_end_precedes_start() {
        let raw = format!("{ANSWER_END} before {ANSWER_START} nothing after");
        assert_eq!(extract_answer(&raw), None);
    }

    #[test]
    fn fallback_embeds_the_raw_response() {
        let fallback = fallback_answer("no tags here");
        assert!(fallback.contains("no tags here"));
    }

    #[test]
    fn instructions_mention_both_markers() {
        let text = sample_instructions();
        assert!(text.contains(ANSWER_START));
        assert!(text.contains(ANSWER_END));
    }

    #[test]
    fn builtins_docs_list_all_three() {
        let docs = builtins_docs("MCP");
        assert!(docs.contains("MCP.Output"));
        assert!(docs.contains("MCP.Sample"));
        assert!(docs.contains("MCP.Wait"));
    }
}
