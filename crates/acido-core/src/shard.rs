use std::path::Path;

use crate::error::Result;

/// Splits newline-delimited `input` into exactly `k` contiguous shards.
/// The first `n mod k` shards get `ceil(n/k)` lines, the rest `floor(n/k)`;
/// line order is preserved and shards may be empty when there are fewer
/// lines than shards. Every shard is newline-terminated.
pub fn shard_lines(input: &str, k: usize) -> Vec<Vec<u8>> {
    assert!(k > 0, "shard count must be positive");
    let lines: Vec<&str> = input.lines().collect();
    let n = lines.len();
    let base = n / k;
    let extra = n % k;

    let mut shards = Vec::with_capacity(k);
    let mut next = 0;
    for g in 0..k {
        let take = base + usize::from(g < extra);
        let mut buf = Vec::new();
        for line in &lines[next..next + take] {
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        next += take;
        shards.push(buf);
    }
    shards
}

pub async fn split(path: &Path, k: usize) -> Result<Vec<Vec<u8>>> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(shard_lines(&text, k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejoin(shards: &[Vec<u8>]) -> String {
        let mut all = Vec::new();
        for s in shards {
            all.extend_from_slice(s);
        }
        String::from_utf8(all).unwrap()
    }

    #[test]
    fn sizes_differ_by_at_most_one() {
        let input = (0..17).map(|i| format!("host-{i}")).collect::<Vec<_>>().join("\n");
        let shards = shard_lines(&input, 5);
        assert_eq!(shards.len(), 5);
        let sizes: Vec<usize> = shards
            .iter()
            .map(|s| s.iter().filter(|&&b| b == b'\n').count())
            .collect();
        assert_eq!(sizes, vec![4, 4, 3, 3, 3]);
    }

    #[test]
    fn order_is_preserved() {
        let input = "a.test\nb.test\nc.test";
        let shards = shard_lines(input, 3);
        assert_eq!(shards[0], b"a.test\n");
        assert_eq!(shards[1], b"b.test\n");
        assert_eq!(shards[2], b"c.test\n");
    }

    #[test]
    fn short_input_yields_empty_shards() {
        let shards = shard_lines("only-one", 4);
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[0], b"only-one\n");
        assert!(shards[1].is_empty());
        assert!(shards[2].is_empty());
        assert!(shards[3].is_empty());
    }

    #[test]
    fn rejoining_recovers_the_input() {
        let input = "one\ntwo\nthree\nfour\nfive\n";
        for k in 1..=7 {
            assert_eq!(rejoin(&shard_lines(input, k)), input, "k={k}");
        }
        // missing trailing newline is normalized
        assert_eq!(rejoin(&shard_lines("x\ny", 2)), "x\ny\n");
    }

    #[test]
    fn empty_input() {
        let shards = shard_lines("", 3);
        assert_eq!(shards.len(), 3);
        assert!(shards.iter().all(Vec::is_empty));
    }
}
