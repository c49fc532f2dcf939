use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::segment::SegmentAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    MissingTag,
    MultipleTags,
    MalformedTriple,
    OutOfRange,
    MisorderedTags,
}

impl ParseErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingTag => "missing_tag",
            Self::MultipleTags => "multiple_tags",
            Self::MalformedTriple => "malformed_triple",
            Self::OutOfRange => "out_of_range",
            Self::MisorderedTags => "misordered_tags",
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub detail: String,
}

impl ParseError {
    fn new(kind: ParseErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingAnswer {
    pub reasoning: Option<String>,
    pub has_reasoning: bool,
    pub layer: u32,
    pub segment_id: u64,
    pub sampling_rate: f64,
}

impl GroundingAnswer {
    pub fn address(&self) -> SegmentAddress {
        SegmentAddress {
            layer: self.layer,
            segment_id: self.segment_id,
        }
    }

    pub fn reasoning_chars(&self) -> usize {
        self.reasoning
            .as_deref()
            .map(|text| text.trim().chars().count())
            .unwrap_or(0)
    }
}

pub fn render_grounding_tag(address: SegmentAddress, sampling_rate: f64) -> String {
    format!(
        "<grounding>{}, {}, {}</grounding>",
        address.layer, address.segment_id, sampling_rate
    )
}

/// Extracts the `<think>` and `<grounding>` spans of one model response.
#[derive(Debug, Clone)]
pub struct GroundingParser {
    grounding_block: Regex,
    grounding_open: Regex,
    think_block: Regex,
}

impl GroundingParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            grounding_block: Regex::new(r"(?is)<\s*grounding\s*>(.*?)<\s*/\s*grounding\s*>")?,
            grounding_open: Regex::new(r"(?i)<\s*grounding\s*>")?,
            think_block: Regex::new(r"(?is)<\s*think\s*>(.*?)<\s*/\s*think\s*>")?,
        })
    }

    pub fn parse(&self, raw_text: &str) -> Result<GroundingAnswer, ParseError> {
        let blocks = self
            .grounding_block
            .captures_iter(raw_text)
            .collect::<Vec<_>>();
        let open_tags = self.grounding_open.find_iter(raw_text).count();

        if blocks.len() > 1 || open_tags > 1 {
            return Err(ParseError::new(
                ParseErrorKind::MultipleTags,
                format!("expected one grounding block, found {}", open_tags.max(blocks.len())),
            ));
        }

        let Some(block) = blocks.into_iter().next() else {
            let detail = if open_tags == 0 {
                "no grounding block"
            } else {
                "unterminated grounding block"
            };
            return Err(ParseError::new(ParseErrorKind::MissingTag, detail));
        };

        let (Some(whole), Some(body)) = (block.get(0), block.get(1)) else {
            return Err(ParseError::new(
                ParseErrorKind::MissingTag,
                "empty grounding capture",
            ));
        };

        let think_blocks = self.think_block.captures_iter(raw_text).collect::<Vec<_>>();
        if think_blocks.len() > 1 {
            return Err(ParseError::new(
                ParseErrorKind::MultipleTags,
                format!("expected at most one think block, found {}", think_blocks.len()),
            ));
        }

        let mut reasoning = None;
        if let Some(think) = think_blocks.first() {
            if let (Some(think_whole), Some(think_body)) = (think.get(0), think.get(1)) {
                if think_whole.end() > whole.start() {
                    return Err(ParseError::new(
                        ParseErrorKind::MisorderedTags,
                        "think block must close before the grounding block opens",
                    ));
                }
                reasoning = Some(think_body.as_str().trim().to_string());
            }
        }

        let (layer, segment_id, sampling_rate) = parse_triple(body.as_str())?;
        let address = SegmentAddress::new(layer, segment_id)
            .map_err(|err| ParseError::new(ParseErrorKind::OutOfRange, err.to_string()))?;

        Ok(GroundingAnswer {
            has_reasoning: reasoning.is_some(),
            reasoning,
            layer: address.layer,
            segment_id: address.segment_id,
            sampling_rate,
        })
    }
}

fn parse_triple(body: &str) -> Result<(i64, i64, f64), ParseError> {
    let tokens = body.split(',').map(str::trim).collect::<Vec<&str>>();
    if tokens.len() != 3 {
        return Err(ParseError::new(
            ParseErrorKind::MalformedTriple,
            format!("expected 3 comma-separated values, found {}", tokens.len()),
        ));
    }

    let layer = tokens[0].parse::<i64>().map_err(|_| {
        ParseError::new(
            ParseErrorKind::MalformedTriple,
            format!("layer is not an integer: {:?}", tokens[0]),
        )
    })?;
    let segment_id = tokens[1].parse::<i64>().map_err(|_| {
        ParseError::new(
            ParseErrorKind::MalformedTriple,
            format!("segment id is not an integer: {:?}", tokens[1]),
        )
    })?;
    let sampling_rate = tokens[2]
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::MalformedTriple,
                format!("sampling rate is not a number: {:?}", tokens[2]),
            )
        })?;

    if sampling_rate <= 0.0 {
        return Err(ParseError::new(
            ParseErrorKind::OutOfRange,
            format!("sampling rate must be positive, got {sampling_rate}"),
        ));
    }

    Ok((layer, segment_id, sampling_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> GroundingParser {
        GroundingParser::new().expect("grounding patterns compile")
    }

    fn error_kind(raw: &str) -> ParseErrorKind {
        parser().parse(raw).expect_err("response should be rejected").kind
    }

    #[test]
    fn parses_reasoning_and_grounding() {
        let answer = parser()
            .parse("<think>x</think><grounding>2, 1, 4</grounding>")
            .expect("well-formed response");

        assert_eq!(answer.layer, 2);
        assert_eq!(answer.segment_id, 1);
        assert_eq!(answer.sampling_rate, 4.0);
        assert!(answer.has_reasoning);
        assert_eq!(answer.reasoning.as_deref(), Some("x"));
    }

    #[test]
    fn reasoning_is_optional() {
        let answer = parser()
            .parse("The answer is <grounding>0,0,1.5</grounding>.")
            .expect("grounding-only response");
        assert!(!answer.has_reasoning);
        assert_eq!(answer.reasoning_chars(), 0);
        assert_eq!(answer.sampling_rate, 1.5);
    }

    #[test]
    fn tolerates_case_and_whitespace_around_tags() {
        let answer = parser()
            .parse("< THINK >\n  look at the start\n</Think>\n<Grounding >\n 3 ,  7 , 2 \n< /grounding>")
            .expect("loose tags");
        assert_eq!(answer.address(), SegmentAddress { layer: 3, segment_id: 7 });
        assert_eq!(answer.reasoning.as_deref(), Some("look at the start"));
    }

    #[test]
    fn missing_grounding_tag_is_reported() {
        assert_eq!(error_kind("<think>no idea</think>"), ParseErrorKind::MissingTag);
        assert_eq!(error_kind("<grounding>1, 0, 2"), ParseErrorKind::MissingTag);
        assert_eq!(error_kind(""), ParseErrorKind::MissingTag);
    }

    #[test]
    fn duplicate_grounding_tags_are_reported() {
        assert_eq!(
            error_kind("<grounding>1, 0, 2</grounding><grounding>1, 1, 2</grounding>"),
            ParseErrorKind::MultipleTags
        );
        assert_eq!(
            error_kind("<grounding>1, 0, 2</grounding> <grounding>"),
            ParseErrorKind::MultipleTags
        );
        assert_eq!(
            error_kind("<think>a</think><think>b</think><grounding>1, 0, 2</grounding>"),
            ParseErrorKind::MultipleTags
        );
    }

    #[test]
    fn malformed_triples_are_reported() {
        for raw in [
            "<grounding>1, 0</grounding>",
            "<grounding>1, 0, 2, 3</grounding>",
            "<grounding>one, 0, 2</grounding>",
            "<grounding>1.5, 0, 2</grounding>",
            "<grounding>1, 0, fast</grounding>",
            "<grounding>1, 0, inf</grounding>",
            "<grounding></grounding>",
        ] {
            assert_eq!(error_kind(raw), ParseErrorKind::MalformedTriple, "{raw}");
        }
    }

    #[test]
    fn segment_beyond_layer_is_out_of_range() {
        assert_eq!(
            error_kind("<grounding>1, 5, 2</grounding>"),
            ParseErrorKind::OutOfRange
        );
        assert_eq!(
            error_kind("<grounding>-1, 0, 2</grounding>"),
            ParseErrorKind::OutOfRange
        );
        assert_eq!(
            error_kind("<grounding>2, -1, 2</grounding>"),
            ParseErrorKind::OutOfRange
        );
    }

    #[test]
    fn non_positive_sampling_rate_is_out_of_range() {
        assert_eq!(
            error_kind("<grounding>1, 1, 0</grounding>"),
            ParseErrorKind::OutOfRange
        );
        assert_eq!(
            error_kind("<grounding>1, 1, -2</grounding>"),
            ParseErrorKind::OutOfRange
        );
    }

    #[test]
    fn think_after_grounding_is_misordered() {
        assert_eq!(
            error_kind("<grounding>1, 1, 2</grounding><think>late</think>"),
            ParseErrorKind::MisorderedTags
        );
        assert_eq!(
            error_kind("<think>wrap <grounding>1, 1, 2</grounding></think>"),
            ParseErrorKind::MisorderedTags
        );
    }

    #[test]
    fn rendered_tag_parses_back() {
        let tag = render_grounding_tag(SegmentAddress { layer: 4, segment_id: 9 }, 2.0);
        assert_eq!(tag, "<grounding>4, 9, 2</grounding>");
        let answer = parser().parse(&tag).expect("rendered tag");
        assert_eq!(answer.address(), SegmentAddress { layer: 4, segment_id: 9 });
    }

    #[test]
    fn parse_error_codes_are_snake_case() {
        let err = parser().parse("nothing").expect_err("missing tag");
        assert_eq!(err.kind.code(), "missing_tag");
        assert!(err.to_string().starts_with("missing_tag: "));
        assert_eq!(
            serde_json::to_string(&ParseErrorKind::OutOfRange).expect("serialize kind"),
            "\"out_of_range\""
        );
    }
}
