use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::fault::ValidationError;
use crate::message::{
    BlockStatus, Citation, CompletedMessage, ContentBlock, Role, ToolResult, ToolUseBlock,
};
use crate::metadata::UsageMetadata;

/// Reserved block key for the single per-message reasoning block.
///
/// Wire indices are non-negative, so the reserved key can never collide and
/// always sorts first when the block map is converted in key order.
pub(crate) const REASONING_BLOCK_INDEX: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Text,
    ToolUse,
    Reasoning,
}

/// Mutable accumulation state for one content block.
#[derive(Clone, Debug)]
pub(crate) struct BlockBuilder {
    pub index: i64,
    pub kind: BlockKind,
    pub text_fragments: Vec<String>,
    pub input_fragments: Vec<String>,
    pub reasoning_fragments: Vec<String>,
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
    pub result: Option<ToolResult>,
    pub status: Option<BlockStatus>,
    pub is_complete: bool,
}

impl BlockBuilder {
    fn empty(index: i64, kind: BlockKind) -> Self {
        Self {
            index,
            kind,
            text_fragments: Vec::new(),
            input_fragments: Vec::new(),
            reasoning_fragments: Vec::new(),
            tool_use_id: None,
            tool_name: None,
            result: None,
            status: None,
            is_complete: false,
        }
    }

    pub(crate) fn text(index: i64) -> Self {
        Self::empty(index, BlockKind::Text)
    }

    pub(crate) fn tool_use(index: i64, tool_use_id: String, tool_name: String) -> Self {
        let mut block = Self::empty(index, BlockKind::ToolUse);
        block.tool_use_id = Some(tool_use_id);
        block.tool_name = Some(tool_name);
        block
    }

    /// A tool block auto-created from a delta; the id and name may arrive
    /// later or never.
    pub(crate) fn tool_use_unnamed(index: i64) -> Self {
        Self::empty(index, BlockKind::ToolUse)
    }

    pub(crate) fn reasoning() -> Self {
        Self::empty(REASONING_BLOCK_INDEX, BlockKind::Reasoning)
    }

    /// Converts the block to its final shape.
    ///
    /// Tool argument text is parsed as JSON. An incomplete block falls back
    /// to an empty object (the stream was cut before the arguments finished);
    /// a complete block with unparseable arguments is a validation failure.
    pub(crate) fn finish(&self) -> Result<ContentBlock, ValidationError> {
        match self.kind {
            BlockKind::Reasoning => Ok(ContentBlock::Reasoning {
                text: self.reasoning_fragments.concat(),
            }),
            BlockKind::Text => Ok(ContentBlock::Text {
                text: self.text_fragments.concat(),
            }),
            BlockKind::ToolUse => {
                let input = match self.parse_input() {
                    Ok(input) => input,
                    Err(error) if self.is_complete => {
                        let index = self.index;
                        return Err(ValidationError::new(
                            "tool_use",
                            format!("block {index} arguments are not valid JSON: {error}"),
                        ));
                    }
                    Err(_) => Value::Object(Map::new()),
                };
                Ok(ContentBlock::ToolUse(self.to_tool_block(input)))
            }
        }
    }

    /// Lenient conversion for the in-progress view; never fails.
    pub(crate) fn preview(&self) -> ContentBlock {
        match self.kind {
            BlockKind::Reasoning => ContentBlock::Reasoning {
                text: self.reasoning_fragments.concat(),
            },
            BlockKind::Text => ContentBlock::Text {
                text: self.text_fragments.concat(),
            },
            BlockKind::ToolUse => {
                let input = self
                    .parse_input()
                    .unwrap_or_else(|_| Value::Object(Map::new()));
                ContentBlock::ToolUse(self.to_tool_block(input))
            }
        }
    }

    fn parse_input(&self) -> Result<Value, serde_json::Error> {
        let raw = self.input_fragments.concat();
        if raw.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&raw)
    }

    fn to_tool_block(&self, input: Value) -> ToolUseBlock {
        ToolUseBlock {
            tool_use_id: self.tool_use_id.clone(),
            name: self.tool_name.clone(),
            input,
            status: self.status,
            result: self.result.clone(),
        }
    }
}

/// Mutable accumulation state for the one in-progress message.
#[derive(Clone, Debug)]
pub(crate) struct MessageBuilder {
    pub id: String,
    pub role: Role,
    pub blocks: BTreeMap<i64, BlockBuilder>,
    pub created_at: DateTime<Utc>,
    pub citations: Vec<Citation>,
    pub is_complete: bool,
}

impl MessageBuilder {
    pub(crate) fn new(id: String, role: Role) -> Self {
        Self {
            id,
            role,
            blocks: BTreeMap::new(),
            created_at: Utc::now(),
            citations: Vec::new(),
            is_complete: false,
        }
    }

    /// Finds or creates the single per-message reasoning block.
    pub(crate) fn reasoning_block(&mut self) -> &mut BlockBuilder {
        self.blocks
            .entry(REASONING_BLOCK_INDEX)
            .or_insert_with(BlockBuilder::reasoning)
    }

    /// Converts the builder into an immutable message record.
    ///
    /// Blocks are converted in key order. A message that streamed zero
    /// blocks yields `None` and is dropped rather than persisted.
    pub(crate) fn finish(
        mut self,
        metadata: Option<UsageMetadata>,
    ) -> Result<Option<CompletedMessage>, ValidationError> {
        if self.blocks.is_empty() {
            return Ok(None);
        }
        let mut content = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.values() {
            content.push(block.finish()?);
        }
        Ok(Some(CompletedMessage {
            id: self.id,
            role: self.role,
            content,
            created_at: self.created_at,
            metadata,
            citations: std::mem::take(&mut self.citations),
        }))
    }

    /// Lenient snapshot of the in-progress message for the current view.
    pub(crate) fn preview(&self, metadata: Option<UsageMetadata>) -> CompletedMessage {
        CompletedMessage {
            id: self.id.clone(),
            role: self.role,
            content: self.blocks.values().map(BlockBuilder::preview).collect(),
            created_at: self.created_at,
            metadata,
            citations: self.citations.clone(),
        }
    }

    /// Plain-text accumulation of the message so far (text blocks only).
    pub(crate) fn plain_text(&self) -> String {
        let mut out = String::new();
        for block in self.blocks.values() {
            if block.kind == BlockKind::Text {
                for fragment in &block.text_fragments {
                    out.push_str(fragment);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blocks_convert_in_index_order_with_reasoning_first() {
        let mut builder = MessageBuilder::new("msg-1".into(), Role::Assistant);
        builder.blocks.insert(2, BlockBuilder::text(2));
        builder.blocks.get_mut(&2).expect("block").text_fragments = vec!["world".into()];
        builder.blocks.insert(0, BlockBuilder::text(0));
        builder.blocks.get_mut(&0).expect("block").text_fragments = vec!["hello ".into()];
        builder.reasoning_block().reasoning_fragments = vec!["thinking".into()];

        let message = builder.finish(None).expect("finish").expect("non-empty");
        assert_eq!(message.content.len(), 3);
        assert!(matches!(
            &message.content[0],
            ContentBlock::Reasoning { text } if text == "thinking"
        ));
        assert!(matches!(
            &message.content[1],
            ContentBlock::Text { text } if text == "hello "
        ));
        assert!(matches!(
            &message.content[2],
            ContentBlock::Text { text } if text == "world"
        ));
    }

    #[test]
    fn zero_block_message_yields_none() {
        let builder = MessageBuilder::new("msg-1".into(), Role::User);
        assert!(builder.finish(None).expect("finish").is_none());
    }

    #[test]
    fn incomplete_tool_block_falls_back_to_empty_input() {
        let mut block = BlockBuilder::tool_use(0, "t1".into(), "calc".into());
        block.input_fragments = vec!["{\"a\":".into()];

        let converted = block.finish().expect("lenient while incomplete");
        assert!(matches!(
            converted,
            ContentBlock::ToolUse(ToolUseBlock { input, .. }) if input == json!({})
        ));
    }

    #[test]
    fn complete_tool_block_with_bad_json_is_a_validation_error() {
        let mut block = BlockBuilder::tool_use(3, "t1".into(), "calc".into());
        block.input_fragments = vec!["{\"a\":".into()];
        block.is_complete = true;

        let error = block.finish().expect_err("complete block must parse");
        assert!(error.detail.contains("block 3"));
    }

    #[test]
    fn empty_input_fragments_parse_to_empty_object() {
        let mut block = BlockBuilder::tool_use(0, "t1".into(), "calc".into());
        block.is_complete = true;
        let converted = block.finish().expect("empty arguments are fine");
        assert!(matches!(
            converted,
            ContentBlock::ToolUse(ToolUseBlock { input, .. }) if input == json!({})
        ));
    }

    #[test]
    fn plain_text_skips_tool_and_reasoning_blocks() {
        let mut builder = MessageBuilder::new("msg-1".into(), Role::Assistant);
        builder.blocks.insert(0, BlockBuilder::text(0));
        builder.blocks.get_mut(&0).expect("block").text_fragments =
            vec!["a".into(), "b".into()];
        builder
            .blocks
            .insert(1, BlockBuilder::tool_use(1, "t1".into(), "calc".into()));
        builder.reasoning_block().reasoning_fragments = vec!["nope".into()];

        assert_eq!(builder.plain_text(), "ab");
    }
}
