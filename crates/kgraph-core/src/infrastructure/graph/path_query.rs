//! Query plans for graph traversal
//!
//! Both builders use numbered parameters so the same value can be referenced
//! from several places in one statement. Seed and start id lists are appended
//! after the fixed parameters.

/// Fixed parameters of [`traversal_sql`]: agent, decay, max depth, min confidence, row cap
pub(crate) const TRAVERSAL_FIXED_PARAMS: usize = 5;

/// Comma-separated `?N` placeholders starting at `first`
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Recursive, cycle-free walk outward from a seed set
///
/// Parameters: `?1` agent, `?2` hop decay, `?3` max depth, `?4` minimum
/// triple confidence past the first hop, `?5` row cap, `?6..` seed ids.
///
/// Paths are encoded as `,a,b,c,` so membership is an `instr` test on
/// `,id,`. Edges are followed in both directions.
pub(crate) fn traversal_sql(seed_count: usize) -> String {
    let seeds = (0..seed_count)
        .map(|i| format!("(?{})", TRAVERSAL_FIXED_PARAMS + 1 + i))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"
        WITH RECURSIVE
        seeds(id) AS (VALUES {seeds}),
        walk(entity_id, depth, score, path, exchange_id, confidence) AS (
            SELECT
                CASE WHEN t.subject IN (SELECT id FROM seeds) THEN t.object ELSE t.subject END,
                1,
                t.confidence * ?2,
                ',' || CASE WHEN t.subject IN (SELECT id FROM seeds) THEN t.subject ELSE t.object END
                    || ',' || CASE WHEN t.subject IN (SELECT id FROM seeds) THEN t.object ELSE t.subject END
                    || ',',
                t.source_exchange_id,
                t.confidence
            FROM triples t
            WHERE t.agent_id = ?1
                AND t.subject != t.object
                AND (t.subject IN (SELECT id FROM seeds) OR t.object IN (SELECT id FROM seeds))

            UNION ALL

            SELECT
                CASE WHEN t.subject = w.entity_id THEN t.object ELSE t.subject END,
                w.depth + 1,
                w.score * ?2,
                w.path || CASE WHEN t.subject = w.entity_id THEN t.object ELSE t.subject END || ',',
                t.source_exchange_id,
                t.confidence
            FROM walk w
            JOIN triples t ON t.agent_id = ?1
                AND (t.subject = w.entity_id OR t.object = w.entity_id)
            WHERE w.depth < ?3
                AND t.confidence >= ?4
                AND t.subject != t.object
                AND EXISTS (
                    SELECT 1 FROM entities e WHERE e.agent_id = ?1 AND e.id = w.entity_id
                )
                AND instr(
                    w.path,
                    ',' || CASE WHEN t.subject = w.entity_id THEN t.object ELSE t.subject END || ','
                ) = 0
            LIMIT ?5
        )
        SELECT depth, score, path, exchange_id, confidence
        FROM walk
        ORDER BY depth, score DESC
        LIMIT ?5
        "#
    )
}

/// Entity column for position `i` of a chained join (0 = start)
fn node(i: usize) -> String {
    if i == 0 {
        "t0.subject".to_string()
    } else {
        format!("t{}.object", i - 1)
    }
}

/// Fixed-depth chained join through an exact predicate sequence
///
/// Parameters: `?1` agent, `?2..?(hops+1)` predicates in order,
/// `?(hops+2)` row limit, then the optional start ids.
///
/// Selected columns: `n0..n{hops}` entity ids, and for each hop `i`
/// `c{i}` confidence, `u{i}` updated_at, `x{i}` source exchange.
pub(crate) fn template_sql(hops: usize, start_count: usize) -> String {
    let mut columns: Vec<String> = (0..=hops).map(|i| format!("{} AS n{}", node(i), i)).collect();
    for i in 0..hops {
        columns.push(format!("t{i}.confidence AS c{i}"));
        columns.push(format!("t{i}.updated_at AS u{i}"));
        columns.push(format!("t{i}.source_exchange_id AS x{i}"));
    }

    let mut joins = String::new();
    for i in 1..hops {
        joins.push_str(&format!(
            "\n            JOIN triples t{i} ON t{i}.agent_id = ?1 AND t{i}.subject = t{prev}.object AND t{i}.predicate = ?{param}",
            prev = i - 1,
            param = i + 2,
        ));
    }

    let mut filters = vec!["t0.agent_id = ?1".to_string(), "t0.predicate = ?2".to_string()];
    // Adjacent nodes already differ since self-loops are never stored
    for i in 0..=hops {
        for j in (i + 2)..=hops {
            filters.push(format!("{} != {}", node(i), node(j)));
        }
    }
    let limit_param = hops + 2;
    if start_count > 0 {
        filters.push(format!(
            "t0.subject IN ({})",
            placeholders(limit_param + 1, start_count)
        ));
    }

    format!(
        r#"
            SELECT {columns}
            FROM triples t0{joins}
            WHERE {filters}
            ORDER BY n0, n{hops}
            LIMIT ?{limit_param}
        "#,
        columns = columns.join(", "),
        filters = filters.join("\n                AND "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(6, 3), "?6, ?7, ?8");
        assert_eq!(placeholders(1, 0), "");
    }

    #[test]
    fn test_traversal_sql_binds_every_seed() {
        let sql = traversal_sql(3);
        assert!(sql.contains("VALUES (?6), (?7), (?8)"));
        assert!(!sql.contains("?9"));
        assert!(sql.contains("WITH RECURSIVE"));
    }

    #[test]
    fn test_template_sql_two_hops() {
        let sql = template_sql(2, 0);
        assert!(sql.contains("JOIN triples t1 ON t1.agent_id = ?1 AND t1.subject = t0.object AND t1.predicate = ?3"));
        assert!(sql.contains("t0.subject != t1.object"));
        assert!(sql.contains("LIMIT ?4"));
        assert!(!sql.contains("t2"));
        assert!(!sql.contains(" IN ("));
    }

    #[test]
    fn test_template_sql_three_hops_with_starts() {
        let sql = template_sql(3, 2);
        assert!(sql.contains("t2.predicate = ?4"));
        assert!(sql.contains("t2.object AS n3"));
        assert!(sql.contains("t0.subject != t2.object"));
        assert!(sql.contains("t0.object != t2.object"));
        assert!(sql.contains("LIMIT ?5"));
        assert!(sql.contains("t0.subject IN (?6, ?7)"));
    }
}
