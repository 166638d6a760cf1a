use std::fmt::{self, Formatter};
use std::marker::PhantomData;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::key::Key;
use crate::{HashMap, HashMapRef};

impl<K, V> Serialize for HashMap<K, V>
where
    K: 'static + Sync + Send + Key + Serialize,
    V: 'static + Sync + Send + Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        // iteration takes the map's exclusive lock for the duration
        let guard = self.guard();
        serializer.collect_map(self.iter(&guard))
    }
}

impl<K, V> Serialize for HashMapRef<'_, K, V>
where
    K: 'static + Sync + Send + Key + Serialize,
    V: 'static + Sync + Send + Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        serializer.collect_map(self.iter())
    }
}

impl<'de, K, V> Deserialize<'de> for HashMap<K, V>
where
    K: 'static + Sync + Send + Key + Deserialize<'de>,
    V: 'static + Sync + Send + Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(HashMapVisitor::new())
    }
}

struct HashMapVisitor<K, V> {
    key_marker: PhantomData<K>,
    value_marker: PhantomData<V>,
}

impl<K, V> HashMapVisitor<K, V> {
    fn new() -> Self {
        Self {
            key_marker: PhantomData,
            value_marker: PhantomData,
        }
    }
}

impl<'de, K, V> Visitor<'de> for HashMapVisitor<K, V>
where
    K: 'static + Sync + Send + Key + Deserialize<'de>,
    V: 'static + Sync + Send + Deserialize<'de>,
{
    type Value = HashMap<K, V>;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "a map")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = HashMap::new();
        {
            let guard = map.guard();
            while let Some((key, value)) = access.next_entry()? {
                map.insert(key, value, &guard);
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use crate::HashMap;

    #[test]
    fn round_trip() {
        let map = HashMap::new();
        {
            let guard = map.guard();
            for i in 0..64u32 {
                map.insert(i, i * 2, &guard);
            }
        }

        let serialized = serde_json::to_string(&map).unwrap();
        let restored: HashMap<u32, u32> = serde_json::from_str(&serialized).unwrap();

        assert_eq!(restored.len(), 64);
        let guard = restored.guard();
        for i in 0..64u32 {
            assert_eq!(restored.get(&i, &guard), Some(&(i * 2)));
        }
    }
}
