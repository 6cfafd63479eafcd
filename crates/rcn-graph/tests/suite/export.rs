use rcn_config::MappingConfig;
use serde_json::Value;

use super::fixtures::{member_type, Fixture};

fn rcns(types: &Value) -> anyhow::Result<Vec<&str>> {
    let types = types
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("`types` is not a sequence"))?;
    types
        .iter()
        .map(|node| {
            node["rcn"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("type node without an rcn: {node}"))
        })
        .collect()
}

#[tokio::test]
async fn graph_serializes_as_plain_sequences() -> anyhow::Result<()> {
    let fixture = Fixture::spawn().await;
    member_type(&fixture).await;
    let snapshotter = fixture.snapshotter(MappingConfig::default()).await;
    let graph = snapshotter.capture().await?;

    let json = serde_json::to_value(&graph)?;
    let names = rcns(&json["types"])?;
    anyhow::ensure!(names.len() == graph.types.len());
    let member_class = fixture.sys("RCNTests.MyClass$MemberClass");
    anyhow::ensure!(
        names.contains(&member_class.as_str()),
        "{member_class} missing from {names:?}"
    );

    let edges = json["edges"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("`edges` is not a sequence"))?;
    anyhow::ensure!(edges.len() == graph.edges.len());
    anyhow::ensure!(edges
        .iter()
        .any(|edge| edge["kind"]["edge"] == "enclosed-by" && edge["from"]["node"] == "type"));
    Ok(())
}
