//! Complexity scoring for staged pipelines.

use crate::backend::PipelineStage;

/// Extra score a stage adds on top of the one point every stage costs.
pub fn stage_penalty(stage: &PipelineStage) -> u32 {
    match stage {
        PipelineStage::Lookup { .. } | PipelineStage::UnionWith { .. } => 3,
        PipelineStage::GraphLookup { max_depth, .. } => {
            if max_depth.is_some() {
                5
            } else {
                10
            }
        }
        PipelineStage::Facet { .. } => 3,
        PipelineStage::Unwind { .. } | PipelineStage::Group => 2,
        PipelineStage::Sort => 1,
        _ => 0,
    }
}

pub fn score_pipeline(stages: &[PipelineStage]) -> u32 {
    stages
        .iter()
        .map(|stage| 1 + stage_penalty(stage))
        .fold(0u32, u32::saturating_add)
}

/// Advisory notes for a pipeline. Deterministic for a given stage list.
pub(crate) fn recommendations(stages: &[PipelineStage]) -> Vec<String> {
    let mut notes = Vec::new();

    let first_join = stages.iter().position(|s| {
        matches!(
            s,
            PipelineStage::Lookup { .. } | PipelineStage::GraphLookup { .. }
        )
    });
    let first_match = stages.iter().position(|s| matches!(s, PipelineStage::Match));
    if let Some(join) = first_join
        && first_match.is_none_or(|m| m > join)
    {
        notes.push("filter with a match stage before joining".to_string());
    }

    if stages.iter().any(|s| matches!(s, PipelineStage::Sort))
        && !stages.iter().any(|s| matches!(s, PipelineStage::Limit { .. }))
    {
        notes.push("pair sort with a limit stage".to_string());
    }

    for stage in stages {
        if let PipelineStage::GraphLookup {
            from,
            max_depth: None,
        } = stage
        {
            notes.push(format!("set max_depth on the graph lookup into {}", from));
        }
    }
    notes
}
