use std::collections::BTreeMap;

use paas_core::ImageRegistry;

pub const REGISTRY_USER: &str = "PAAS_REGISTRY_USER";
pub const REGISTRY_PASSWORD: &str = "PAAS_REGISTRY_PASSWORD";
pub const REGISTRY_HOST: &str = "PAAS_REGISTRY_HOST";

/// Job variables plus registry credentials. The registry keys always come
/// from the identity, whatever the job declared.
pub fn build_env(variables: &BTreeMap<String, String>, registry: &ImageRegistry) -> BTreeMap<String, String> {
    let mut env = variables.clone();
    let (user, password) = match &registry.identity {
        Some(id) => (id.user.clone(), id.password.clone()),
        None => (String::new(), String::new()),
    };
    env.insert(REGISTRY_USER.to_string(), user);
    env.insert(REGISTRY_PASSWORD.to_string(), password);
    env.insert(REGISTRY_HOST.to_string(), registry.url.clone());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use paas_core::Identity;

    #[test]
    fn registry_keys_cannot_be_overridden() {
        let vars = BTreeMap::from([
            ("APP_ENV".to_string(), "prod".to_string()),
            (REGISTRY_USER.to_string(), "intruder".to_string()),
        ]);
        let registry = ImageRegistry {
            url: "registry.example".into(),
            identity: Some(Identity { user: "robot".into(), password: "s3cret".into(), ..Identity::default() }),
        };
        let env = build_env(&vars, &registry);
        assert_eq!(env["APP_ENV"], "prod");
        assert_eq!(env[REGISTRY_USER], "robot");
        assert_eq!(env[REGISTRY_PASSWORD], "s3cret");
        assert_eq!(env[REGISTRY_HOST], "registry.example");
    }
}
