//! 工作单元分类
//! Unit-of-work classification
//!
//! 先按声明的单元类型精确匹配，再按名称子串匹配，都不命中则为 UNKNOWN
//! Declared unit type first (exact), then name substrings, else UNKNOWN

use super::span::SpanKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 声明的单元类型 → Span 类型
/// Declared unit type → span kind
pub const UNIT_TYPE_RULES: &[(&str, SpanKind)] = &[
    ("chain", SpanKind::Chain),
    ("agent", SpanKind::Agent),
    ("tool", SpanKind::Tool),
    ("llm", SpanKind::Llm),
    ("chat_model", SpanKind::Llm),
    ("retriever", SpanKind::Retriever),
];

/// 名称子串 → Span 类型，按顺序匹配
/// Name substring → span kind, first match wins
pub const NAME_RULES: &[(&str, SpanKind)] = &[
    ("agent", SpanKind::Agent),
    ("tool", SpanKind::Tool),
    ("retriev", SpanKind::Retriever),
    ("llm", SpanKind::Llm),
    ("chat_model", SpanKind::Llm),
    ("generation", SpanKind::Llm),
    ("chain", SpanKind::Chain),
];

/// 工作单元元数据
/// Unit-of-work metadata reported by the host framework
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitMetadata {
    /// 单元名称（节点名）
    /// Unit name (node name)
    pub name: String,
    /// 声明的单元类型
    /// Declared unit type
    pub unit_type: Option<String>,
    /// 显式指定的类型，优先于规则表
    /// Explicit kind, takes precedence over the rule tables
    pub kind: Option<SpanKind>,
    /// 附加元数据（步骤、节点、路径等）
    /// Extra metadata (step, node, path and so on)
    pub metadata: BTreeMap<String, Value>,
    /// 标签
    /// Tags
    pub tags: Vec<String>,
}

impl UnitMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_unit_type(mut self, unit_type: impl Into<String>) -> Self {
        self.unit_type = Some(unit_type.into());
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn classify(&self) -> SpanKind {
        classify(self)
    }
}

/// 分类函数，对任意输入都有结果
/// Total classification function
pub fn classify(meta: &UnitMetadata) -> SpanKind {
    if let Some(kind) = meta.kind {
        return kind;
    }

    if let Some(unit_type) = &meta.unit_type {
        let unit_type = unit_type.to_ascii_lowercase();
        if let Some((_, kind)) = UNIT_TYPE_RULES.iter().find(|(t, _)| *t == unit_type) {
            return *kind;
        }
    }

    let name = meta.name.to_ascii_lowercase();
    NAME_RULES
        .iter()
        .find(|(pattern, _)| name.contains(pattern))
        .map(|(_, kind)| *kind)
        .unwrap_or(SpanKind::Unknown)
}
