//! 复合主键 - 多实例本地镜像的唯一标识
//!
//! 格式：{instance_id}_{remote_id}。instance_id 为 UUID（不含下划线），
//! 因此不同实例的相同 remote_id 永远不会产生相同的复合键。
//! 只有生成，没有解析：所有查询都通过生成器重新构造键。

/// 复合键分隔符
const SEPARATOR: char = '_';

/// 由 (instance_id, remote_id) 生成本地复合主键，纯函数、确定性
pub fn composite_id(instance_id: &str, remote_id: &str) -> String {
    format!("{}{}{}", instance_id, SEPARATOR, remote_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_id_is_deterministic() {
        let a = composite_id("7f3c", "series-1");
        let b = composite_id("7f3c", "series-1");
        assert_eq!(a, b);
        assert_eq!(a, "7f3c_series-1");
    }

    #[test]
    fn different_instances_never_collide() {
        // UUID 形式的 instance_id 不含下划线，键空间按实例隔离
        let ids = ["0a1b2c3d", "9f8e7d6c", "55aa55aa"];
        let remote = "book-42";
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            assert!(seen.insert(composite_id(id, remote)));
        }
    }

    #[test]
    fn same_remote_id_distinct_per_instance() {
        assert_ne!(composite_id("i1", "x"), composite_id("i2", "x"));
    }
}
