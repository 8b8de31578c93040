// 主题语法与通配符匹配
// 主题由点分隔的非空分段组成；`*` 匹配一个分段，`**` 仅可作为末段并匹配零个或多个分段

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{CoreError, CoreResult};

static SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("分段正则表达式合法"));

/// 判断单个分段是否合法
pub fn is_valid_segment(segment: &str) -> bool {
    SEGMENT_RE.is_match(segment)
}

/// 校验发布主题
pub fn validate_topic(topic: &str) -> CoreResult<()> {
    if topic.is_empty() {
        return Err(CoreError::invalid_topic(topic, "主题不能为空"));
    }
    for segment in topic.split('.') {
        if segment.is_empty() {
            return Err(CoreError::invalid_topic(topic, "存在空分段"));
        }
        if !is_valid_segment(segment) {
            return Err(CoreError::invalid_topic(
                topic,
                format!("分段 `{}` 含有非法字符", segment),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`
    Single,
    /// `**`
    Trailing,
}

/// 已解析的订阅模式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> CoreResult<Self> {
        if pattern.is_empty() {
            return Err(CoreError::invalid_pattern(pattern, "模式不能为空"));
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (index, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => return Err(CoreError::invalid_pattern(pattern, "存在空分段")),
                "*" => Segment::Single,
                "**" if index == last => Segment::Trailing,
                "**" => return Err(CoreError::invalid_pattern(pattern, "`**` 只能作为最后一段")),
                literal if is_valid_segment(literal) => Segment::Literal(literal.to_string()),
                other => {
                    return Err(CoreError::invalid_pattern(
                        pattern,
                        format!("分段 `{}` 不是合法的名称或通配符", other),
                    ));
                }
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 判断主题是否匹配；纯函数，大小写敏感
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Trailing => return true,
                Segment::Single => {
                    if index >= parts.len() {
                        return false;
                    }
                }
                Segment::Literal(expected) => {
                    if parts.get(index) != Some(&expected.as_str()) {
                        return false;
                    }
                }
            }
        }

        parts.len() == self.segments.len()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.raw
    }
}

/// 便捷函数：解析模式并匹配主题
pub fn topic_matches(pattern: &str, topic: &str) -> CoreResult<bool> {
    Ok(TopicPattern::parse(pattern)?.matches(topic))
}
