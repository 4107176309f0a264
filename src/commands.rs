//! The handful of commands the core itself must be able to issue: the
//! `HELLO` handshake, teardown, subscription management, and the couple of
//! data commands exercised by the core's own tests. This is not a generated
//! command table.

use crate::arg::build_command;
use crate::error::RedisResult;

pub fn hello(protover: i64, username: Option<&str>, password: Option<&str>, client_name: Option<&str>) -> RedisResult<Vec<Vec<u8>>> {
    let mut tokens = vec![b"HELLO".to_vec(), protover.to_string().into_bytes()];
    if let (Some(user), Some(pass)) = (username, password) {
        tokens.push(b"AUTH".to_vec());
        tokens.push(user.as_bytes().to_vec());
        tokens.push(pass.as_bytes().to_vec());
    }
    if let Some(name) = client_name {
        tokens.push(b"SETNAME".to_vec());
        tokens.push(name.as_bytes().to_vec());
    }
    Ok(tokens)
}

pub fn quit() -> RedisResult<Vec<Vec<u8>>> {
    build_command("QUIT", &[])
}

pub fn subscribe(channels: &[String]) -> RedisResult<Vec<Vec<u8>>> {
    let mut tokens = vec![b"SUBSCRIBE".to_vec()];
    tokens.extend(channels.iter().map(|c| c.as_bytes().to_vec()));
    Ok(tokens)
}

pub fn unsubscribe(channels: &[String]) -> RedisResult<Vec<Vec<u8>>> {
    let mut tokens = vec![b"UNSUBSCRIBE".to_vec()];
    tokens.extend(channels.iter().map(|c| c.as_bytes().to_vec()));
    Ok(tokens)
}

pub fn psubscribe(patterns: &[String]) -> RedisResult<Vec<Vec<u8>>> {
    let mut tokens = vec![b"PSUBSCRIBE".to_vec()];
    tokens.extend(patterns.iter().map(|p| p.as_bytes().to_vec()));
    Ok(tokens)
}

pub fn punsubscribe(patterns: &[String]) -> RedisResult<Vec<Vec<u8>>> {
    let mut tokens = vec![b"PUNSUBSCRIBE".to_vec()];
    tokens.extend(patterns.iter().map(|p| p.as_bytes().to_vec()));
    Ok(tokens)
}

pub fn publish(channel: &str, message: &[u8]) -> RedisResult<Vec<Vec<u8>>> {
    build_command("PUBLISH", &[&channel, &message])
}

pub fn get(key: &str) -> RedisResult<Vec<Vec<u8>>> {
    build_command("GET", &[&key])
}

pub fn set(key: &str, value: &[u8]) -> RedisResult<Vec<Vec<u8>>> {
    build_command("SET", &[&key, &value])
}

pub fn monitor() -> RedisResult<Vec<Vec<u8>>> {
    build_command("MONITOR", &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_with_auth_and_name() {
        let tokens = hello(3, Some("default"), Some("secret"), Some("resp3client")).unwrap();
        assert_eq!(
            tokens,
            vec![
                b"HELLO".to_vec(),
                b"3".to_vec(),
                b"AUTH".to_vec(),
                b"default".to_vec(),
                b"secret".to_vec(),
                b"SETNAME".to_vec(),
                b"resp3client".to_vec(),
            ]
        );
    }

    #[test]
    fn hello_without_credentials() {
        let tokens = hello(3, None, None, None).unwrap();
        assert_eq!(tokens, vec![b"HELLO".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn subscribe_lists_all_channels() {
        let tokens = subscribe(&["a".into(), "b".into()]).unwrap();
        assert_eq!(
            tokens,
            vec![b"SUBSCRIBE".to_vec(), b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn publish_builds_three_tokens() {
        let tokens = publish("chan", b"hi").unwrap();
        assert_eq!(
            tokens,
            vec![b"PUBLISH".to_vec(), b"chan".to_vec(), b"hi".to_vec()]
        );
    }
}
