use crate::{Error, Result};

static SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace of the pod we run in, as mounted by the service account
pub fn get_my_namespace() -> Result<String> {
    read_namespace_file(SERVICE_ACCOUNT_NAMESPACE)
}

fn read_namespace_file(path: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|ns| ns.trim_end_matches('\n').to_string())
        .map_err(Error::IoError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn namespace_file_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "openshift-storage").unwrap();
        let ns = read_namespace_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(ns, "openshift-storage");
    }

    #[test]
    fn missing_namespace_file_is_io_error() {
        let err = read_namespace_file("/nonexistent/namespace").unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
    }
}
