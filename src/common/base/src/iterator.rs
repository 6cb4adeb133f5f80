/// AsyncIterator is a fallible iterator whose items may need I/O to produce.
#[async_trait]
pub trait AsyncIterator {
    type Item;
    async fn try_next(&mut self) -> anyhow::Result<Option<Self::Item>>;
}

/// try_collect drains the iterator into a vector, stopping at the first error.
pub async fn try_collect<I>(itr: &mut I) -> anyhow::Result<Vec<I::Item>>
where
    I: AsyncIterator + Send,
    I::Item: Send,
{
    let mut items = Vec::new();
    while let Some(item) = itr.try_next().await? {
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown(u32);

    #[async_trait]
    impl AsyncIterator for Countdown {
        type Item = u32;

        async fn try_next(&mut self) -> anyhow::Result<Option<u32>> {
            if self.0 == 0 {
                return Ok(None);
            }
            if self.0 == 100 {
                anyhow::bail!("countdown too long");
            }
            self.0 -= 1;
            Ok(Some(self.0))
        }
    }

    #[tokio::test]
    async fn test_try_collect() {
        let got = try_collect(&mut Countdown(3)).await.unwrap();
        assert_eq!(got, vec![2, 1, 0]);
        assert!(try_collect(&mut Countdown(0)).await.unwrap().is_empty());
        assert!(try_collect(&mut Countdown(100)).await.is_err());
    }
}
