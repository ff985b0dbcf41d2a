//! Always-firing rule for executor and pipeline harnesses. Disabled by
//! default; select it explicitly by id.

use anyhow::Result;
use async_trait::async_trait;

use super::{ChainContext, Rule, RuleMeta};
use crate::model::{ActionType, Finding, FindingCategory, Severity};

pub const RULE_ID: &str = "MOCK_ALWAYS_FIND";

const META: RuleMeta = RuleMeta {
    id: RULE_ID,
    name: "Mock always-find",
    description: "Emits one informational finding per evaluation",
    default_severity: Severity::Info,
    category: FindingCategory::System,
    enabled_by_default: false,
    version: "1.0.0",
};

#[derive(Default)]
pub struct MockAlwaysFind;

impl MockAlwaysFind {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Rule for MockAlwaysFind {
    fn meta(&self) -> &RuleMeta {
        &META
    }

    async fn evaluate(&self, ctx: &dyn ChainContext) -> Result<Vec<Finding>> {
        Ok(vec![Finding::new(
            RULE_ID,
            "Mock finding",
            "Synthetic finding emitted unconditionally",
            Severity::Info,
            FindingCategory::System,
            ctx.current_block(),
            ctx.block_timestamp() * 1000,
            ActionType::None,
        )])
    }
}
