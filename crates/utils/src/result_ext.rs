/// Logging failures which should not stop the caller.
pub trait ResultExt<T> {
    /// Unwrap the value, or warn about the error and use `T::default()`.
    fn log_err_default(self) -> T
    where
        T: Default;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    #[track_caller]
    fn log_err_default(self) -> T
    where
        T: Default,
    {
        self.unwrap_or_else(|e| {
            tracing::warn!("{e:#}");
            T::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_err_default() {
        assert_eq!(Ok::<_, String>(5).log_err_default(), 5);
        let err: anyhow::Result<Vec<u32>> = Err(anyhow::anyhow!("umount: target is busy"));
        assert!(err.log_err_default().is_empty());
        Err::<(), _>(anyhow::anyhow!("ignored")).log_err_default();
    }
}
