// 依赖解析器
// 确定性拓扑排序，平局按声明顺序打破；管理器与插件共用

use std::collections::{HashMap, HashSet};

use crate::errors::{CoreError, CoreResult};

/// 依赖图节点：`dependencies` 中的每一项必须排在该节点之前
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub name: String,
    pub dependencies: Vec<String>,
}

impl DependencyNode {
    pub fn new<I, S>(name: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

/// 依赖解析器
pub struct DependencyResolver;

impl DependencyResolver {
    /// 计算启动顺序
    ///
    /// 先检查缺失依赖，再排序；存在环时返回环上的路径。
    pub fn resolve(nodes: &[DependencyNode]) -> CoreResult<Vec<String>> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if index.insert(node.name.as_str(), position).is_some() {
                return Err(CoreError::invalid_name(&node.name, "依赖图中名称重复"));
            }
        }

        for node in nodes {
            for dependency in &node.dependencies {
                if !index.contains_key(dependency.as_str()) {
                    return Err(CoreError::missing_dependency(&node.name, dependency));
                }
            }
        }

        let mut placed = vec![false; nodes.len()];
        let mut order = Vec::with_capacity(nodes.len());

        while order.len() < nodes.len() {
            let ready = nodes.iter().enumerate().find(|(position, node)| {
                !placed[*position]
                    && node
                        .dependencies
                        .iter()
                        .all(|dependency| placed[index[dependency.as_str()]])
            });

            match ready {
                Some((position, node)) => {
                    placed[position] = true;
                    order.push(node.name.clone());
                }
                None => {
                    let cycle = Self::find_cycle(nodes, &index, &placed);
                    return Err(CoreError::CyclicDependency { cycle });
                }
            }
        }

        Ok(order)
    }

    /// 在尚未排序的节点中寻找一个环，路径首尾为同一节点
    fn find_cycle(nodes: &[DependencyNode], index: &HashMap<&str, usize>, placed: &[bool]) -> Vec<String> {
        let mut finished: HashSet<usize> = HashSet::new();

        for start in (0..nodes.len()).filter(|i| !placed[*i]) {
            if finished.contains(&start) {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            let mut on_path: Vec<usize> = vec![start];

            while let Some((current, next_edge)) = stack.last_mut() {
                let current = *current;
                let dependencies = &nodes[current].dependencies;
                if *next_edge >= dependencies.len() {
                    finished.insert(current);
                    stack.pop();
                    on_path.pop();
                    continue;
                }

                let target = index[dependencies[*next_edge].as_str()];
                *next_edge += 1;
                if placed[target] || finished.contains(&target) {
                    continue;
                }
                if let Some(position) = on_path.iter().position(|n| *n == target) {
                    let mut cycle: Vec<String> =
                        on_path[position..].iter().map(|n| nodes[*n].name.clone()).collect();
                    cycle.push(nodes[target].name.clone());
                    return cycle;
                }
                stack.push((target, 0));
                on_path.push(target);
            }
        }

        Vec::new()
    }

    /// 直接依赖 `name` 的节点（按声明顺序）
    pub fn dependents<'a>(nodes: &'a [DependencyNode], name: &str) -> Vec<&'a str> {
        nodes
            .iter()
            .filter(|node| node.dependencies.iter().any(|d| d == name))
            .map(|node| node.name.as_str())
            .collect()
    }
}
